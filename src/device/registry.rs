use indexmap::IndexMap;

/// Identity seam between the registry and the transport handle type, so the
/// registry logic can be exercised without a radio.
pub trait DeviceIdentity {
    fn identity(&self) -> &str;
    fn display_name(&self) -> Option<&str>;
}

/// De-duplicated, insertion-ordered collection of discovered peripherals.
/// Only advertisements whose name contains the configured token are retained;
/// everything else is dropped at the point of discovery.
#[derive(Debug)]
pub struct DeviceRegistry<H> {
    name_token: String,
    entries: IndexMap<String, H>,
}

impl<H: DeviceIdentity> DeviceRegistry<H> {
    pub fn new(name_token: impl Into<String>) -> Self {
        DeviceRegistry {
            name_token: name_token.into(),
            entries: IndexMap::new(),
        }
    }

    /// Stores a discovered handle, returning true if it was kept. Handles
    /// without a matching name token are ignored; a handle whose identity is
    /// already known is a no-op (first-seen order is preserved).
    pub fn on_discovered(&mut self, handle: H) -> bool {
        let matches_token = handle
            .display_name()
            .map(|name| name.contains(&self.name_token))
            .unwrap_or(false);

        if !matches_token {
            return false;
        }

        if self.entries.contains_key(handle.identity()) {
            return false;
        }

        self.entries.insert(handle.identity().to_string(), handle);
        true
    }

    /// Clears the registry; called when a new scan cycle begins.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, identity: &str) -> Option<&H> {
        self.entries.get(identity)
    }

    /// Discovery-ordered view for the device picker.
    pub fn handles(&self) -> impl Iterator<Item = &H> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeHandle {
        identity: String,
        name: Option<String>,
    }

    impl FakeHandle {
        fn new(identity: &str, name: Option<&str>) -> Self {
            FakeHandle {
                identity: identity.to_string(),
                name: name.map(str::to_string),
            }
        }
    }

    impl DeviceIdentity for FakeHandle {
        fn identity(&self) -> &str {
            &self.identity
        }

        fn display_name(&self) -> Option<&str> {
            self.name.as_deref()
        }
    }

    #[test]
    fn duplicates_are_ignored_and_order_is_first_seen() {
        let mut registry = DeviceRegistry::new("UART");

        assert!(registry.on_discovered(FakeHandle::new("aa", Some("UART-X"))));
        assert!(registry.on_discovered(FakeHandle::new("bb", Some("UART-Y"))));
        assert!(!registry.on_discovered(FakeHandle::new("aa", Some("UART-X"))));
        assert!(registry.on_discovered(FakeHandle::new("cc", Some("UART-Z"))));

        let order: Vec<&str> = registry.handles().map(|h| h.identity()).collect();
        assert_eq!(order, vec!["aa", "bb", "cc"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn name_token_filter_applies_at_discovery() {
        let mut registry = DeviceRegistry::new("UART");

        assert!(registry.on_discovered(FakeHandle::new("aa", Some("UART-X"))));
        assert!(!registry.on_discovered(FakeHandle::new("bb", Some("OtherDevice"))));
        assert!(!registry.on_discovered(FakeHandle::new("cc", None)));

        assert!(registry.get("aa").is_some());
        assert!(registry.get("bb").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reset_clears_the_sequence() {
        let mut registry = DeviceRegistry::new("UART");
        registry.on_discovered(FakeHandle::new("aa", Some("UART-X")));

        registry.reset();

        assert!(registry.is_empty());
        // the identity may be rediscovered in the next cycle
        assert!(registry.on_discovered(FakeHandle::new("aa", Some("UART-X"))));
    }
}
