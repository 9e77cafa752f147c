use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when working with a BLE power meter
#[derive(Error, Debug)]
pub enum PowerMeterError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No device was selected, or a previously bonded device is no longer known
    #[error("Power meter not available")]
    DeviceUnavailable,

    /// The GATT link could not be opened
    #[error("Failed to open GATT link: {0}")]
    LinkUnavailable(String),

    /// A required service is missing on the device
    #[error("Service {0} not found")]
    ServiceNotFound(Uuid),

    /// A required characteristic is missing on the device
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    /// Enabling notifications on a characteristic failed
    #[error("Failed to subscribe to notifications: {0}")]
    SubscribeFailed(String),

    /// A notification payload could not be decoded
    #[error("Malformed {kind} payload: {len} bytes, expected at least {expected}")]
    MalformedPayload {
        /// Payload kind that failed to decode
        kind: &'static str,
        /// Actual payload length in bytes
        len: usize,
        /// Minimum payload length in bytes
        expected: usize,
    },

    /// A command was issued while no link is established
    #[error("Not connected to a power meter")]
    NotConnected,

    /// A catalog command that takes a parameter was issued without one
    #[error("Command {mnemonic} requires a value ({unit})")]
    MissingParameter {
        /// Command mnemonic
        mnemonic: String,
        /// Parameter unit or kind expected by the device
        unit: &'static str,
    },

    /// Invalid user input for a command or the calibration wizard
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A recording is already running
    #[error("Recording already in progress")]
    AlreadyRecording,

    /// No recording is running
    #[error("No recording in progress")]
    NotRecording,

    /// Writing to the control characteristic failed
    #[error("Failed to write command: {0}")]
    WriteFailed(String),

    /// A transport operation timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// A connect or reconnect attempt was overtaken by a newer connect or disconnect
    #[error("Superseded by a newer connection request")]
    Superseded,

    /// Automatic reconnection gave up
    #[error("Reconnection failed after {attempts} attempts")]
    MaxReconnectAttemptsExceeded {
        /// Number of attempts made
        attempts: u32,
    },
}

/// Result type for power meter operations
pub type Result<T> = std::result::Result<T, PowerMeterError>;

impl PowerMeterError {
    /// Check if this error indicates a connection lifecycle issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::DeviceUnavailable
                | Self::LinkUnavailable(_)
                | Self::ServiceNotFound(_)
                | Self::CharacteristicNotFound(_)
                | Self::SubscribeFailed(_)
                | Self::Timeout { .. }
        )
    }

    /// Check if the session survives this error
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedPayload { .. }
                | Self::MissingParameter { .. }
                | Self::InvalidInput(_)
                | Self::AlreadyRecording
                | Self::NotRecording
                | Self::WriteFailed(_)
        )
    }

    /// Check if this error ends the session until a fresh connect
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::MaxReconnectAttemptsExceeded { .. })
    }
}
