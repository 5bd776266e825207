use std::future::Future;
use std::sync::Mutex;

use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::channel::mpsc::Sender;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::constants::{
    make_exercise_notify_uuid, make_exercise_service_uuid, make_exercise_write_uuid,
};
use crate::device::scan::ScanController;
use crate::device::types::{ConnectedPeripheral, DeviceEvent, PeripheralHandle, SessionPhase};
use crate::error::ConnectionError;
use crate::exercise::SharedParameters;

/// Outbound write seam. The connection session is the production
/// implementation; exercise-state tests substitute a recording fake.
pub trait CommandLink {
    fn send_frame(
        &self,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

/**
 * The phase/generation core of the connection state machine. Every transport
 * completion carries the generation it was issued under; a completion whose
 * generation has been superseded (by a disconnect or a failure) is stale and
 * must be discarded instead of transitioning state.
 */
#[derive(Debug)]
struct SessionCore {
    phase: SessionPhase,
    generation: u64,
}

impl SessionCore {
    fn new() -> Self {
        SessionCore {
            phase: SessionPhase::Disconnected,
            generation: 0,
        }
    }

    fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Disconnected → Connecting. A second attempt while one is outstanding
    /// fails fast rather than queueing.
    fn begin_connect(&mut self) -> Result<u64, ConnectionError> {
        if self.phase != SessionPhase::Disconnected {
            return Err(ConnectionError::AlreadyConnected);
        }

        self.generation += 1;
        self.phase = SessionPhase::Connecting;
        Ok(self.generation)
    }

    /// Connecting → Discovering, unless the completion is stale.
    fn transport_connected(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.phase != SessionPhase::Connecting {
            return false;
        }

        self.phase = SessionPhase::Discovering;
        true
    }

    /// Discovering → Subscribed, unless the completion is stale.
    fn subscribed(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.phase != SessionPhase::Discovering {
            return false;
        }

        self.phase = SessionPhase::Subscribed;
        true
    }

    /// Reverts a failed attempt to Disconnected. Stale failures are ignored.
    fn fail(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }

        self.phase = SessionPhase::Disconnected;
        true
    }

    /// Valid from any phase; bumping the generation invalidates the eventual
    /// completion of any outstanding connect/discover sequence.
    fn disconnect(&mut self) {
        self.generation += 1;
        self.phase = SessionPhase::Disconnected;
    }
}

/// Owns the lifecycle of the connection to exactly one peripheral: connect,
/// discovery, notify subscription, write, disconnect.
pub struct ConnectionSession {
    core: Mutex<SessionCore>,
    connected: Mutex<Option<ConnectedPeripheral>>,
    notify_cancel: Mutex<Option<CancellationToken>>,
    params: SharedParameters,
    events: Sender<DeviceEvent>,
}

impl ConnectionSession {
    pub fn new(params: SharedParameters, events: Sender<DeviceEvent>) -> Self {
        ConnectionSession {
            core: Mutex::new(SessionCore::new()),
            connected: Mutex::new(None),
            notify_cancel: Mutex::new(None),
            params,
            events,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.core.lock().expect("session mutex poisoned").phase()
    }

    /// Connects to the given peripheral, discovers the exercise service,
    /// stops the active scan and subscribes to the notify characteristic.
    /// Any failure reverts to Disconnected with no partial state retained.
    pub async fn connect(
        &self,
        handle: PeripheralHandle,
        scan: &ScanController,
    ) -> Result<(), ConnectionError> {
        let generation = {
            let mut core = self.core.lock().expect("session mutex poisoned");
            core.begin_connect()?
        };
        self.emit(DeviceEvent::Phase(SessionPhase::Connecting)).await;

        info!("Connecting to peripheral {}...", handle.identity);
        if let Err(err) = handle.peripheral.connect().await {
            self.abort_attempt(generation).await;
            return Err(ConnectionError::from_transport(err));
        }

        let advanced = {
            let mut core = self.core.lock().expect("session mutex poisoned");
            core.transport_connected(generation)
        };
        if !advanced {
            debug!("Dropping stale connect completion for {}", handle.identity);
            let _ = handle.peripheral.disconnect().await;
            return Ok(());
        }
        self.emit(DeviceEvent::Phase(SessionPhase::Discovering)).await;

        info!("Connected; discovering services...");
        let (write_char, notify_char) = match discover_exercise_characteristics(&handle.peripheral).await {
            Ok(chars) => chars,
            Err(err) => {
                let _ = handle.peripheral.disconnect().await;
                self.abort_attempt(generation).await;
                return Err(err);
            }
        };

        // the scan has served its purpose once a connection attempt reaches
        // a discovered device
        scan.stop_scan().await;

        info!("Subscribing to characteristic {:?}", notify_char.uuid);
        if let Err(err) = handle.peripheral.subscribe(&notify_char).await {
            let _ = handle.peripheral.disconnect().await;
            self.abort_attempt(generation).await;
            return Err(ConnectionError::from_transport(err));
        }

        let cancel = CancellationToken::new();
        let committed = {
            let mut core = self.core.lock().expect("session mutex poisoned");
            if core.subscribed(generation) {
                let connected = ConnectedPeripheral {
                    handle: handle.clone(),
                    write_char,
                    notify_char,
                };
                *self.connected.lock().expect("session mutex poisoned") = Some(connected);
                *self.notify_cancel.lock().expect("session mutex poisoned") = Some(cancel.clone());
                true
            } else {
                false
            }
        };
        if !committed {
            debug!("Dropping stale subscribe completion for {}", handle.identity);
            let _ = handle.peripheral.disconnect().await;
            return Ok(());
        }

        read_notifications_task(
            cancel,
            handle.peripheral.clone(),
            self.params.clone(),
            self.events.clone(),
        );

        self.emit(DeviceEvent::Phase(SessionPhase::Subscribed)).await;
        info!("Peripheral ready");
        Ok(())
    }

    /// Cancels the transport connection and any outstanding connect sequence,
    /// returning to Disconnected. Idempotent.
    pub async fn disconnect(&self) {
        let (was_active, taken, cancel) = {
            let mut core = self.core.lock().expect("session mutex poisoned");
            let was_active = core.phase() != SessionPhase::Disconnected;
            core.disconnect();

            let taken = self.connected.lock().expect("session mutex poisoned").take();
            let cancel = self.notify_cancel.lock().expect("session mutex poisoned").take();
            (was_active, taken, cancel)
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        if let Some(connected) = taken {
            info!("Disconnecting from peripheral {}", connected.handle.identity);
            if let Err(err) = connected.handle.peripheral.disconnect().await {
                warn!("Failed to cancel transport connection: {:?}", err);
            }
        }

        if was_active {
            self.emit(DeviceEvent::Phase(SessionPhase::Disconnected)).await;
        }
    }

    /// Fire-and-forget write to the write characteristic. Valid only while
    /// Subscribed; acknowledgement, if any, arrives via the notify channel.
    pub async fn write(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        let (peripheral, write_char) = {
            let core = self.core.lock().expect("session mutex poisoned");
            if core.phase() != SessionPhase::Subscribed {
                return Err(ConnectionError::NotConnected);
            }

            let connected = self.connected.lock().expect("session mutex poisoned");
            let connected = connected.as_ref().ok_or(ConnectionError::NotConnected)?;
            (connected.handle.peripheral.clone(), connected.write_char.clone())
        };

        peripheral
            .write(&write_char, payload, WriteType::WithoutResponse)
            .await
            .map_err(ConnectionError::from_transport)
    }

    async fn abort_attempt(&self, generation: u64) {
        let reverted = {
            let mut core = self.core.lock().expect("session mutex poisoned");
            core.fail(generation)
        };

        if reverted {
            self.emit(DeviceEvent::Phase(SessionPhase::Disconnected)).await;
        }
    }

    async fn emit(&self, event: DeviceEvent) {
        let mut events = self.events.clone();
        if events.send(event).await.is_err() {
            debug!("Device event receiver is gone");
        }
    }
}

impl CommandLink for ConnectionSession {
    async fn send_frame(&self, payload: Vec<u8>) -> Result<(), ConnectionError> {
        self.write(&payload).await
    }
}

async fn discover_exercise_characteristics(
    peripheral: &Peripheral,
) -> Result<(Characteristic, Characteristic), ConnectionError> {
    peripheral
        .discover_services()
        .await
        .map_err(ConnectionError::from_transport)?;

    let service_uuid = make_exercise_service_uuid();
    let write_uuid = make_exercise_write_uuid();
    let notify_uuid = make_exercise_notify_uuid();

    for service in peripheral.services() {
        if !service.uuid.eq(&service_uuid) {
            continue;
        }

        let mut write_char = None;
        let mut notify_char = None;
        for characteristic in &service.characteristics {
            if characteristic.uuid.eq(&write_uuid) {
                write_char = Some(characteristic.clone());
            } else if characteristic.uuid.eq(&notify_uuid) {
                notify_char = Some(characteristic.clone());
            }
        }

        if let (Some(write_char), Some(notify_char)) = (write_char, notify_char) {
            return Ok((write_char, notify_char));
        }
    }

    Err(ConnectionError::Discovery)
}

/// Decodes every notification from the notify characteristic and applies
/// valid settings lines to the shared parameter record. Malformed payloads
/// are reported and otherwise ignored; no retransmission is requested.
fn read_notifications_task(
    cancel: CancellationToken,
    peripheral: Peripheral,
    params: SharedParameters,
    mut events: Sender<DeviceEvent>,
) -> JoinHandle<Result<(), ConnectionError>> {
    spawn(async move {
        let mut notification_stream = peripheral
            .notifications()
            .await
            .map_err(ConnectionError::from_transport)?;
        let notify_uuid = make_exercise_notify_uuid();

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                next = notification_stream.next() => {
                    let Some(data) = next else {
                        break 'mainloop;
                    };
                    if !data.uuid.eq(&notify_uuid) {
                        continue;
                    }

                    let event = match params.apply_inbound(&data.value) {
                        Ok(applied) => DeviceEvent::SettingsReplaced(applied),
                        Err(err) => {
                            warn!("Rejected inbound settings payload: {}", err);
                            DeviceEvent::DecodeFault(err)
                        },
                    };
                    if events.send(event).await.is_err() {
                        break 'mainloop;
                    }
                }
            }
        }

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_sequence_advances_through_all_phases() {
        let mut core = SessionCore::new();
        assert_eq!(core.phase(), SessionPhase::Disconnected);

        let generation = core.begin_connect().unwrap();
        assert_eq!(core.phase(), SessionPhase::Connecting);

        assert!(core.transport_connected(generation));
        assert_eq!(core.phase(), SessionPhase::Discovering);

        assert!(core.subscribed(generation));
        assert_eq!(core.phase(), SessionPhase::Subscribed);
    }

    #[test]
    fn second_connect_fails_fast_in_every_active_phase() {
        let mut core = SessionCore::new();
        let generation = core.begin_connect().unwrap();
        assert!(matches!(core.begin_connect(), Err(ConnectionError::AlreadyConnected)));

        core.transport_connected(generation);
        assert!(matches!(core.begin_connect(), Err(ConnectionError::AlreadyConnected)));

        core.subscribed(generation);
        assert!(matches!(core.begin_connect(), Err(ConnectionError::AlreadyConnected)));
    }

    #[test]
    fn disconnect_before_subscribed_drops_the_late_completion() {
        let mut core = SessionCore::new();
        let generation = core.begin_connect().unwrap();
        assert!(core.transport_connected(generation));

        core.disconnect();
        assert_eq!(core.phase(), SessionPhase::Disconnected);

        // the discovery completion arrives after the disconnect; it must not
        // transition state
        assert!(!core.subscribed(generation));
        assert_eq!(core.phase(), SessionPhase::Disconnected);
    }

    #[test]
    fn failure_reverts_to_disconnected_and_allows_a_new_attempt() {
        let mut core = SessionCore::new();
        let generation = core.begin_connect().unwrap();

        assert!(core.fail(generation));
        assert_eq!(core.phase(), SessionPhase::Disconnected);

        let next = core.begin_connect().unwrap();
        assert!(next > generation);
    }

    #[test]
    fn stale_failure_does_not_disturb_a_new_attempt() {
        let mut core = SessionCore::new();
        let first = core.begin_connect().unwrap();
        core.disconnect();

        let second = core.begin_connect().unwrap();
        assert!(!core.fail(first));
        assert_eq!(core.phase(), SessionPhase::Connecting);
        assert!(core.transport_connected(second));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut core = SessionCore::new();
        core.disconnect();
        core.disconnect();
        assert_eq!(core.phase(), SessionPhase::Disconnected);
    }
}
