use serde::{Deserialize, Serialize};

use crate::device::constants::DEFAULT_NAME_TOKEN;
use crate::device::types::ExerciseParameters;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Advertising-name substring that identifies the stimulation firmware.
    pub device_name_token: String,
    /// Parameters to seed a new session with, before the peripheral or the
    /// user changes them.
    pub parameters: ExerciseParameters,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_name_token: DEFAULT_NAME_TOKEN.to_string(),
            parameters: ExerciseParameters::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_uses_camel_case_keys() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(json.contains("\"deviceNameToken\""));
        assert!(json.contains("\"initialDelayMs\""));

        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Config::default());
    }
}
