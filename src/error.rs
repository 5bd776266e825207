use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;

/**
 * Failure to interpret an inbound settings payload. These are expected
 * transient link noise: the previous valid parameters stay in effect and the
 * error is surfaced as an event, never as a panic or a torn state.
 */
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("settings line does not end with the '.' terminator")]
    MissingTerminator,

    #[error("settings line has {count} fields, expected 4")]
    FieldCount { count: usize },

    #[error("settings field {token:?} is not a non-negative integer")]
    BadField { token: String },

    #[error("payload is not valid base64-wrapped ASCII text")]
    Transport,
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("transport failure: {source}")]
    Transport { #[from] source: btleplug::Error },

    #[error("bluetooth permission has not been granted")]
    PermissionDenied,

    #[error("no bluetooth adapter is available")]
    NoAdapter,

    #[error("the exercise service or its characteristics were not found on the peripheral")]
    Discovery,

    #[error("a connection is already established or in progress")]
    AlreadyConnected,

    #[error("no peripheral is connected")]
    NotConnected,
}

impl ConnectionError {
    /// Maps btleplug scan/connect errors, pulling the permission case out so
    /// the frontend can tell the user to grant access rather than retry.
    pub fn from_transport(source: btleplug::Error) -> Self {
        match source {
            btleplug::Error::PermissionDenied => ConnectionError::PermissionDenied,
            source => ConnectionError::Transport { source },
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("stimulation strength {value} is above the maximum of 100")]
    StrengthOutOfRange { value: u32 },

    #[error("settings can not be changed while the exercise is running")]
    ExerciseRunning,
}

/// Failure to transmit a settings line: either the local gate rejected it or
/// the link did.
#[derive(Error, Debug)]
pub enum PushError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    Config { #[from] source: ConfigError },

    #[error("Device session failed: {source}")]
    Connection { #[from] source: ConnectionError },

    #[error("Failed to transmit settings: {source}")]
    Push { #[from] source: PushError },

    #[error("No matching peripheral was discovered before the scan window closed")]
    NoDeviceFound,
}
