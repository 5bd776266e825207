use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc::Sender;
use futures::SinkExt;
use log::debug;
use tokio::spawn;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::device::codec::{decode_settings, encode_command, encode_settings, Command};
use crate::device::session::CommandLink;
use crate::device::types::{DeviceEvent, ExerciseParameters, ParameterField};
use crate::error::{ConnectionError, DecodeError, PushError, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
}

/**
 * The four-field parameter record, shared between the notification reader
 * and local edits. Both sides go through the one mutex, so an inbound decode
 * always lands as one atomic group and a reader never observes a torn set.
 */
#[derive(Debug, Clone)]
pub struct SharedParameters {
    inner: Arc<Mutex<ExerciseParameters>>,
}

impl SharedParameters {
    pub fn new(params: ExerciseParameters) -> Self {
        SharedParameters {
            inner: Arc::new(Mutex::new(params)),
        }
    }

    pub fn snapshot(&self) -> ExerciseParameters {
        *self.inner.lock().expect("parameters mutex poisoned")
    }

    /// Decodes an inbound settings payload and, only if the whole line is
    /// valid, replaces all four fields at once. A failed decode leaves the
    /// record untouched.
    pub fn apply_inbound(&self, raw: &[u8]) -> Result<ExerciseParameters, DecodeError> {
        let params = decode_settings(raw)?;
        *self.inner.lock().expect("parameters mutex poisoned") = params;
        Ok(params)
    }

    /// Local single-field edit. Strength above 100 is rejected without
    /// mutating anything; no clamping.
    pub fn set_field(&self, field: ParameterField, value: u32) -> Result<(), ValidationError> {
        if field == ParameterField::StimulationStrength && value > 100 {
            return Err(ValidationError::StrengthOutOfRange { value });
        }

        let mut params = self.inner.lock().expect("parameters mutex poisoned");
        match field {
            ParameterField::InitialDelay => params.initial_delay_ms = value,
            ParameterField::StimulationTime => params.stimulation_time_ms = value,
            ParameterField::RestTime => params.rest_time_ms = value,
            ParameterField::StimulationStrength => params.stimulation_strength_pct = value,
        }
        Ok(())
    }
}

/// App-side model of the exercise: the tunable parameters plus the
/// running/paused flag, and the arbitration between local edits, inbound
/// notifications and outbound pushes.
pub struct ExerciseSession {
    params: SharedParameters,
    run_state: RunState,
    ticker: Option<CancellationToken>,
    events: Sender<DeviceEvent>,
}

impl ExerciseSession {
    pub fn new(params: SharedParameters, events: Sender<DeviceEvent>) -> Self {
        ExerciseSession {
            params,
            run_state: RunState::Idle,
            ticker: None,
            events,
        }
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn parameters(&self) -> ExerciseParameters {
        self.params.snapshot()
    }

    /// Validates and applies a local edit. Mutates local state only; nothing
    /// is transmitted until an explicit push_settings call.
    pub fn request_parameter_change(
        &self,
        field: ParameterField,
        value: u32,
    ) -> Result<(), ValidationError> {
        self.params.set_field(field, value)
    }

    /// Transmits the current settings line. Rejected while the exercise is
    /// running; settings must not change mid-exercise.
    pub async fn push_settings(&self, link: &impl CommandLink) -> Result<(), PushError> {
        if self.run_state == RunState::Running {
            return Err(ValidationError::ExerciseRunning.into());
        }

        let payload = encode_settings(&self.params.snapshot());
        link.send_frame(payload).await?;
        Ok(())
    }

    /// Transmits start when idle and pause when running, updating the run
    /// state only after the transmit succeeded. The metronome ticker follows
    /// the run state; its cadence is the rest time at the moment of starting.
    pub async fn toggle_run(&mut self, link: &impl CommandLink) -> Result<RunState, ConnectionError> {
        match self.run_state {
            RunState::Idle => {
                link.send_frame(encode_command(Command::Start)).await?;
                self.run_state = RunState::Running;
                self.start_ticker();
            },
            RunState::Running => {
                link.send_frame(encode_command(Command::Pause)).await?;
                self.run_state = RunState::Idle;
                self.stop_ticker();
            },
        }

        let mut events = self.events.clone();
        if events.send(DeviceEvent::RunState(self.run_state)).await.is_err() {
            debug!("Device event receiver is gone");
        }

        Ok(self.run_state)
    }

    /// Clears everything that only makes sense while connected: the run flag
    /// and the ticker. The parameters are local settings and survive.
    pub fn reset_for_disconnect(&mut self) {
        self.stop_ticker();
        self.run_state = RunState::Idle;
    }

    fn start_ticker(&mut self) {
        self.stop_ticker();

        let rest_time_ms = self.params.snapshot().rest_time_ms.max(1);
        let cadence = Duration::from_millis(u64::from(rest_time_ms));
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut events = self.events.clone();

        spawn(async move {
            'tick: loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        break 'tick;
                    },
                    _ = sleep(cadence) => {
                        if events.send(DeviceEvent::Tick).await.is_err() {
                            break 'tick;
                        }
                    }
                }
            }
        });

        self.ticker = Some(cancel);
    }

    fn stop_ticker(&mut self) {
        if let Some(cancel) = self.ticker.take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc::channel;

    struct RecordingLink {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingLink {
        fn new() -> Self {
            RecordingLink { frames: Mutex::new(Vec::new()) }
        }

        fn frames(&self) -> Vec<Vec<u8>> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl CommandLink for RecordingLink {
        async fn send_frame(&self, payload: Vec<u8>) -> Result<(), ConnectionError> {
            self.frames.lock().unwrap().push(payload);
            Ok(())
        }
    }

    struct DeadLink;

    impl CommandLink for DeadLink {
        async fn send_frame(&self, _payload: Vec<u8>) -> Result<(), ConnectionError> {
            Err(ConnectionError::NotConnected)
        }
    }

    fn session() -> (ExerciseSession, futures::channel::mpsc::Receiver<DeviceEvent>) {
        let (events, receiver) = channel::<DeviceEvent>(64);
        let params = SharedParameters::new(ExerciseParameters::default());
        (ExerciseSession::new(params, events), receiver)
    }

    #[test]
    fn strength_above_100_is_rejected_without_mutation() {
        let (exercise, _rx) = session();

        let result = exercise.request_parameter_change(ParameterField::StimulationStrength, 101);
        assert_eq!(result, Err(ValidationError::StrengthOutOfRange { value: 101 }));
        assert_eq!(exercise.parameters().stimulation_strength_pct, 100);

        assert_eq!(
            exercise.request_parameter_change(ParameterField::StimulationStrength, 100),
            Ok(()),
        );
        assert_eq!(exercise.parameters().stimulation_strength_pct, 100);
    }

    #[test]
    fn other_fields_accept_any_non_negative_value() {
        let (exercise, _rx) = session();

        exercise.request_parameter_change(ParameterField::InitialDelay, 5000).unwrap();
        exercise.request_parameter_change(ParameterField::StimulationTime, 1).unwrap();
        exercise.request_parameter_change(ParameterField::RestTime, 0).unwrap();

        let params = exercise.parameters();
        assert_eq!(params.initial_delay_ms, 5000);
        assert_eq!(params.stimulation_time_ms, 1);
        assert_eq!(params.rest_time_ms, 0);
    }

    #[tokio::test]
    async fn toggle_run_twice_transmits_start_then_pause_and_ends_idle() {
        let (mut exercise, _rx) = session();
        let link = RecordingLink::new();

        assert_eq!(exercise.toggle_run(&link).await.unwrap(), RunState::Running);
        assert_eq!(exercise.toggle_run(&link).await.unwrap(), RunState::Idle);

        let frames = link.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], encode_command(Command::Start));
        assert_eq!(frames[1], encode_command(Command::Pause));
        assert_eq!(exercise.run_state(), RunState::Idle);
    }

    #[tokio::test]
    async fn toggle_run_without_a_connection_leaves_state_untouched() {
        let (mut exercise, _rx) = session();

        let result = exercise.toggle_run(&DeadLink).await;
        assert!(matches!(result, Err(ConnectionError::NotConnected)));
        assert_eq!(exercise.run_state(), RunState::Idle);
    }

    #[tokio::test]
    async fn push_settings_transmits_the_encoded_line_when_idle() {
        let (exercise, _rx) = session();
        let link = RecordingLink::new();

        exercise.push_settings(&link).await.unwrap();

        let frames = link.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], encode_settings(&ExerciseParameters::default()));
    }

    #[tokio::test]
    async fn push_settings_is_rejected_while_running() {
        let (mut exercise, _rx) = session();
        let link = RecordingLink::new();

        exercise.toggle_run(&link).await.unwrap();
        let result = exercise.push_settings(&link).await;

        assert!(matches!(
            result,
            Err(PushError::Validation(ValidationError::ExerciseRunning)),
        ));
        // only the start command went out
        assert_eq!(link.frames().len(), 1);
    }

    #[tokio::test]
    async fn reset_for_disconnect_returns_to_idle_and_keeps_parameters() {
        let (mut exercise, _rx) = session();
        let link = RecordingLink::new();

        exercise.request_parameter_change(ParameterField::RestTime, 500).unwrap();
        exercise.toggle_run(&link).await.unwrap();

        exercise.reset_for_disconnect();

        assert_eq!(exercise.run_state(), RunState::Idle);
        assert_eq!(exercise.parameters().rest_time_ms, 500);
    }

    #[test]
    fn inbound_decode_replaces_all_fields_atomically() {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;

        let shared = SharedParameters::new(ExerciseParameters::default());

        let applied = shared.apply_inbound(BASE64.encode("0 250 750 100.").as_bytes()).unwrap();
        assert_eq!(applied, shared.snapshot());
        assert_eq!(applied.rest_time_ms, 750);

        // three fields: nothing is applied, the prior record stays intact
        let err = shared.apply_inbound(BASE64.encode("10 20 30.").as_bytes()).unwrap_err();
        assert_eq!(err, DecodeError::FieldCount { count: 3 });
        assert_eq!(shared.snapshot(), applied);
    }
}
