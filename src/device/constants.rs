use uuid::Uuid;

/**
 * The UUID of the custom BLE service exposed by the stimulation peripheral.
 * Nordic UART layout: one write-only channel, one notify-only channel.
 */
pub const EXERCISE_SERVICE: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

/**
 * The UUID of the write-only (RX from the peripheral's point of view)
 * characteristic that settings lines and start/pause commands are sent to.
 */
pub const EXERCISE_WRITE_CHARACTERISTIC: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";

/**
 * The UUID of the notify-only (TX) characteristic the peripheral pushes its
 * settings lines through. Distinct from the write characteristic; the
 * firmware requires one channel per direction.
 */
pub const EXERCISE_NOTIFY_CHARACTERISTIC: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/**
 * Substring of the advertising name that identifies the product's firmware.
 * Advertisements without it are dropped at the point of discovery.
 */
pub const DEFAULT_NAME_TOKEN: &str = "UART";

pub fn make_exercise_service_uuid() -> Uuid {
    Uuid::parse_str(EXERCISE_SERVICE).unwrap()
}

pub fn make_exercise_write_uuid() -> Uuid {
    Uuid::parse_str(EXERCISE_WRITE_CHARACTERISTIC).unwrap()
}

pub fn make_exercise_notify_uuid() -> Uuid {
    Uuid::parse_str(EXERCISE_NOTIFY_CHARACTERISTIC).unwrap()
}
