#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Wattlers 🚴
//!
//! A Rust library for driving cycling power meters over Bluetooth Low Energy.
//!
//! The meter exposes three GATT services: the standard Cycling Power service
//! for live power and cadence, the standard Battery service, and a vendor
//! config service carrying a free-text log stream plus a text command
//! channel for configuration and calibration.
//!
//! This crate provides:
//!
//! - **Session management**: connect, subscribe to all notification sources
//!   and supervise the link with bounded automatic reconnection
//! - **Wire codec**: decoding of power, battery and log notifications
//! - **Command protocol**: the catalog of vendor command mnemonics and the
//!   flat `<mnemonic><value>` command grammar
//! - **Telemetry**: a rolling 60-sample window for live display and session
//!   recordings exported as CSV
//! - **Calibration wizard**: the weight calibration sequence
//!   `C{L|R}W<kg>` → `CA` → `CP`
//!
//! ## Quick Start
//!
//! ```no_run
//! use wattlers::{BtleplugTransport, PowerMeterSession, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::default();
//!     let transport = BtleplugTransport::new(&config).await?;
//!     let session = PowerMeterSession::new(transport, config);
//!
//!     // Scan, connect and subscribe
//!     session.connect().await?;
//!
//!     // Start offset compensation
//!     session.dispatch("OC", None).await?;
//!
//!     // Record a few samples
//!     session.start_recording().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!     let recording = session.stop_recording().await?;
//!     std::fs::write(recording.filename(), recording.to_csv())?;
//!
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```

/// btleplug-backed transport
pub mod ble;
/// Calibration wizard
pub mod calibration;
/// Vendor command catalog and dispatch
pub mod commands;
/// Error types and handling
pub mod error;
/// Notification payload decoding and command encoding
pub mod protocol;
/// Connection session and reconnection supervision
pub mod session;
/// Live telemetry window and recordings
pub mod telemetry;
/// Transport abstraction over the BLE stack
pub mod transport;
/// Type definitions and data structures
pub mod types;

use uuid::Uuid;

// Re-export the main types for convenient usage
pub use ble::BtleplugTransport;
pub use calibration::{CalibrationSide, CalibrationStep, CalibrationWizard, WizardInput};
pub use commands::{CommandCategory, CommandSink, CommandSpec, CATALOG};
pub use error::{PowerMeterError, Result};
pub use session::PowerMeterSession;
pub use telemetry::{Recording, TelemetryStore, TelemetryWindow, TELEMETRY_WINDOW_SIZE};
pub use transport::{NotificationSource, Transport, TransportEvent};
pub use types::{
    LogEntry, MeterReadings, PowerSample, RecordingStatus, SessionConfig, SessionSnapshot,
    SessionState, MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY_MS,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cycling Power service
pub const POWER_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1818_0000_1000_8000_0080_5f9b_34fb);

/// Battery service
pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_0080_5f9b_34fb);

/// Vendor config service carrying the log and control characteristics
pub const CONFIG_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_cafe_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Power Measurement characteristic (0x2A63)
pub const POWER_MEASUREMENT_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2a63_0000_1000_8000_0080_5f9b_34fb);

/// Battery Level characteristic (0x2A19)
pub const BATTERY_LEVEL_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2a19_0000_1000_8000_0080_5f9b_34fb);

/// Vendor log characteristic, notifies free-text log lines
pub const LOG_CHAR_UUID: Uuid = Uuid::from_u128(0x5abc_3692_fca4_4a69_955d_cd04_42de_273f);

/// Vendor control characteristic, accepts text commands
pub const CONTROL_CHAR_UUID: Uuid = Uuid::from_u128(0x3591_6a45_9726_4ef4_b09d_f328_4968_f03c);

/// Services a power meter must offer
pub const REQUIRED_SERVICES: [Uuid; 3] = [
    POWER_SERVICE_UUID,
    CONFIG_SERVICE_UUID,
    BATTERY_SERVICE_UUID,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_values() {
        assert_eq!(
            POWER_SERVICE_UUID.to_string(),
            "00001818-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            CONFIG_SERVICE_UUID.to_string(),
            "0000cafe-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            BATTERY_SERVICE_UUID.to_string(),
            "0000180f-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            POWER_MEASUREMENT_CHAR_UUID.to_string(),
            "00002a63-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            BATTERY_LEVEL_CHAR_UUID.to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            LOG_CHAR_UUID,
            Uuid::parse_str("5abc3692-fca4-4a69-955d-cd0442de273f").unwrap()
        );
        assert_eq!(
            CONTROL_CHAR_UUID,
            Uuid::parse_str("35916a45-9726-4ef4-b09d-f3284968f03c").unwrap()
        );
    }
}
