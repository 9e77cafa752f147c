use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    fmt,
    time::{Instant, SystemTime},
};

use crate::protocol::PowerReading;

/// Default reconnect attempts before a session is abandoned
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Default fixed delay before each reconnect attempt
pub const RECONNECT_DELAY_MS: u64 = 2_000;

/// Battery level reported until the meter sends its first battery notification
pub const DEFAULT_BATTERY_PERCENT: u8 = 100;

/// Connection state of a power meter session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No link and no session
    Disconnected,
    /// Initial connect in progress
    Connecting,
    /// Link established and all notifications subscribed
    Connected,
    /// Link lost unexpectedly, automatic reconnection running
    Reconnecting,
    /// Automatic reconnection gave up; only a fresh connect leaves this state
    Failed,
}

impl SessionState {
    /// Check if a connect request would start a new lifecycle operation
    #[must_use]
    pub const fn accepts_connect(self) -> bool {
        matches!(self, Self::Disconnected | Self::Connected | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Failed => write!(f, "Connection Failed"),
        }
    }
}

/// One decoded power measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerSample {
    /// Arrival time
    pub timestamp: Instant,
    /// Instantaneous power in watts
    pub power: u16,
    /// Cadence in revolutions per minute
    pub cadence: u16,
}

impl PowerSample {
    /// Create a sample stamped with the current instant
    #[must_use]
    pub fn now(reading: PowerReading) -> Self {
        Self::at(Instant::now(), reading)
    }

    /// Create a sample stamped with `timestamp`
    #[must_use]
    pub const fn at(timestamp: Instant, reading: PowerReading) -> Self {
        Self {
            timestamp,
            power: reading.power,
            cadence: reading.cadence,
        }
    }
}

/// Decoded log line from the vendor log characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Wall-clock arrival time
    pub timestamp: SystemTime,
    /// Decoded text
    pub message: String,
}

impl LogEntry {
    /// Create an entry stamped with the current wall-clock time
    #[must_use]
    pub fn new(message: String) -> Self {
        Self {
            timestamp: SystemTime::now(),
            message,
        }
    }

    /// Local time of arrival formatted as `HH:MM:SS`
    #[must_use]
    pub fn time_label(&self) -> String {
        DateTime::<Local>::from(self.timestamp)
            .format("%H:%M:%S")
            .to_string()
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.time_label(), self.message)
    }
}

/// Latest values reported by the meter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterReadings {
    /// Instantaneous power in watts
    pub power: u16,
    /// Cadence in revolutions per minute
    pub cadence: u16,
    /// Battery charge in percent
    pub battery_percent: u8,
    /// Log lines, newest first
    pub logs: VecDeque<LogEntry>,
}

impl Default for MeterReadings {
    fn default() -> Self {
        Self {
            power: 0,
            cadence: 0,
            battery_percent: DEFAULT_BATTERY_PERCENT,
            logs: VecDeque::new(),
        }
    }
}

impl MeterReadings {
    /// Prepend a log entry, dropping the oldest past `capacity`
    pub fn push_log(&mut self, entry: LogEntry, capacity: Option<usize>) {
        self.logs.push_front(entry);
        if let Some(capacity) = capacity {
            self.logs.truncate(capacity);
        }
    }
}

/// Point on the live power chart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowPoint {
    /// Milliseconds since the Unix epoch
    pub time_ms: u64,
    /// Instantaneous power in watts
    pub power: u16,
}

/// Recording progress for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingStatus {
    /// A recording is running
    pub active: bool,
    /// Samples captured so far
    pub samples: usize,
    /// Time since the recording started in milliseconds
    pub elapsed_ms: u64,
}

/// Read model consumed by presentation collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Connection state
    pub state: SessionState,
    /// Current reconnect attempt count
    pub reconnect_attempt: u32,
    /// Maximum reconnect attempts configured
    pub max_reconnect_attempts: u32,
    /// Latest readings and logs
    pub readings: MeterReadings,
    /// Recent power values for the live chart, oldest first
    pub telemetry_window: Vec<WindowPoint>,
    /// Recording progress
    pub recording: RecordingStatus,
}

impl SessionSnapshot {
    /// Banner text for the reconnecting and failed states
    #[must_use]
    pub fn status_message(&self) -> Option<String> {
        match self.state {
            SessionState::Reconnecting => Some(format!(
                "Attempting to reconnect... Try {} of {}",
                (self.reconnect_attempt + 1).min(self.max_reconnect_attempts),
                self.max_reconnect_attempts
            )),
            SessionState::Failed => Some(
                "Unable to reconnect to the device. Please try connecting again.".to_string(),
            ),
            _ => None,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Scan duration when requesting a device, in milliseconds
    pub scan_timeout_ms: u64,
    /// GATT link connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Reconnect attempts before the session is abandoned
    pub max_reconnect_attempts: u32,
    /// Fixed delay before each reconnect attempt in milliseconds
    pub reconnect_delay_ms: u64,
    /// Maximum retained log lines, `None` keeps all
    pub log_capacity: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 30_000,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: RECONNECT_DELAY_MS,
            log_capacity: None,
        }
    }
}
