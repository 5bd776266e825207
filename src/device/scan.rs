use std::sync::{Arc, Mutex};

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::channel::mpsc::Sender;
use futures::{SinkExt, StreamExt};
use log::{info, warn};
use tokio::spawn;
use tokio_util::sync::CancellationToken;

use crate::device::registry::DeviceRegistry;
use crate::device::types::{DeviceEvent, PeripheralHandle};
use crate::error::ConnectionError;

/// Orchestrates the discover-and-filter loop feeding the device registry.
/// Owns the adapter explicitly; there is no module-level radio singleton.
pub struct ScanController {
    adapter: Adapter,
    registry: Arc<Mutex<DeviceRegistry<PeripheralHandle>>>,
    events: Sender<DeviceEvent>,
    scan_cancel: Mutex<Option<CancellationToken>>,
}

impl ScanController {
    pub async fn new(
        name_token: impl Into<String>,
        events: Sender<DeviceEvent>,
    ) -> Result<Self, ConnectionError> {
        let manager = Manager::new().await.map_err(ConnectionError::from_transport)?;
        let adapters = manager.adapters().await.map_err(ConnectionError::from_transport)?;
        let adapter = adapters.into_iter().next().ok_or(ConnectionError::NoAdapter)?;

        Ok(ScanController {
            adapter,
            registry: Arc::new(Mutex::new(DeviceRegistry::new(name_token))),
            events,
            scan_cancel: Mutex::new(None),
        })
    }

    /// Begins passive discovery. There is no service filter at the radio
    /// level; filtering happens on the advertising name in the registry.
    /// Fails fast when the platform has not granted bluetooth permission.
    pub async fn start_scan(&self) -> Result<(), ConnectionError> {
        self.stop_scan().await;
        self.registry.lock().expect("registry mutex poisoned").reset();

        info!(
            "Scanning using adapter {}...",
            self.adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()),
        );
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(ConnectionError::from_transport)?;

        let mut event_stream = self
            .adapter
            .events()
            .await
            .map_err(ConnectionError::from_transport)?;

        let cancel = CancellationToken::new();
        *self.scan_cancel.lock().expect("scan mutex poisoned") = Some(cancel.clone());

        let adapter = self.adapter.clone();
        let registry = self.registry.clone();
        let mut events = self.events.clone();

        spawn(async move {
            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    next = event_stream.next() => {
                        let Some(event) = next else {
                            break 'mainloop;
                        };
                        let id = match event {
                            CentralEvent::DeviceDiscovered(id) => id,
                            // the local name often arrives in a later
                            // advertisement than the first sighting
                            CentralEvent::DeviceUpdated(id) => id,
                            _ => continue,
                        };

                        let handle = match resolve_handle(&adapter, &id).await {
                            Ok(handle) => handle,
                            Err(err) => {
                                warn!("Could not query discovered peripheral: {:?}", err);
                                continue;
                            },
                        };

                        let stored = registry
                            .lock()
                            .expect("registry mutex poisoned")
                            .on_discovered(handle.clone());
                        if stored {
                            let name = handle.name.clone().unwrap_or_default();
                            let discovered = DeviceEvent::Discovered {
                                identity: handle.identity,
                                name,
                            };
                            if events.send(discovered).await.is_err() {
                                break 'mainloop;
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Stops the scan cycle. Idempotent; also invoked by the connection
    /// session the moment a connection attempt reaches discovery success.
    pub async fn stop_scan(&self) {
        let cancel = self.scan_cancel.lock().expect("scan mutex poisoned").take();
        let Some(cancel) = cancel else {
            return;
        };

        cancel.cancel();
        if let Err(err) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {:?}", err);
        }
    }

    /// The registry backing this scan, ordered by first sighting; read by the
    /// device-picker collaborator.
    pub fn registry(&self) -> Arc<Mutex<DeviceRegistry<PeripheralHandle>>> {
        self.registry.clone()
    }

    pub fn lookup(&self, identity: &str) -> Option<PeripheralHandle> {
        self.registry
            .lock()
            .expect("registry mutex poisoned")
            .get(identity)
            .cloned()
    }
}

async fn resolve_handle(
    adapter: &Adapter,
    id: &PeripheralId,
) -> Result<PeripheralHandle, btleplug::Error> {
    let peripheral = adapter.peripheral(id).await?;
    let name = peripheral
        .properties()
        .await?
        .and_then(|properties| properties.local_name);

    Ok(PeripheralHandle {
        identity: peripheral.id().to_string(),
        name,
        peripheral,
    })
}
