use btleplug::api::Characteristic;
use btleplug::platform::Peripheral;
use serde::{Deserialize, Serialize};

use crate::device::registry::DeviceIdentity;
use crate::error::DecodeError;
use crate::exercise::RunState;

/// A peripheral seen during a scan, held by the registry until the user picks
/// it (or the scan cycle is reset).
#[derive(Debug, Clone)]
pub struct PeripheralHandle {
    /// Platform-assigned identity, stable for the duration of a scan cycle.
    pub identity: String,
    /// Advertised local name, if the advertisement carried one.
    pub name: Option<String>,
    /// Raw transport handle owned by the platform's radio stack.
    pub peripheral: Peripheral,
}

impl DeviceIdentity for PeripheralHandle {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn display_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// The single connected peripheral plus its resolved characteristics. Built
/// only once discovery has succeeded; dropped on disconnect.
#[derive(Debug, Clone)]
pub struct ConnectedPeripheral {
    pub handle: PeripheralHandle,
    pub write_char: Characteristic,
    pub notify_char: Characteristic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Discovering,
    Subscribed,
}

/// The four tunable exercise parameters. Replaced as one atomic group by a
/// valid inbound decode; mutated per-field by local edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseParameters {
    pub initial_delay_ms: u32,
    pub stimulation_time_ms: u32,
    pub rest_time_ms: u32,
    pub stimulation_strength_pct: u32,
}

impl Default for ExerciseParameters {
    fn default() -> Self {
        ExerciseParameters {
            initial_delay_ms: 0,
            stimulation_time_ms: 250,
            rest_time_ms: 750,
            stimulation_strength_pct: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterField {
    InitialDelay,
    StimulationTime,
    RestTime,
    StimulationStrength,
}

/// Events pushed from the device layer to whichever frontend is listening.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Phase(SessionPhase),
    Discovered { identity: String, name: String },
    SettingsReplaced(ExerciseParameters),
    RunState(RunState),
    /// Cosmetic metronome trigger on the rest-time cadence; carries no
    /// protocol meaning.
    Tick,
    DecodeFault(DecodeError),
}
