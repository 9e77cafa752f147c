use crate::error::{PowerMeterError, Result};
use bytes::{Buf, Bytes};

/// Minimum length of a cycling power measurement payload
///
/// Bytes 0-1 carry the flags field of the standard Cycling Power Measurement
/// characteristic, bytes 2-3 the instantaneous power and bytes 4-5 the
/// cadence reported by the meter firmware.
pub const POWER_PAYLOAD_MIN: usize = 6;

/// Minimum length of a battery level payload
pub const BATTERY_PAYLOAD_MIN: usize = 1;

/// Power and cadence decoded from one power measurement notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerReading {
    /// Instantaneous power in watts
    pub power: u16,
    /// Cadence in revolutions per minute
    pub cadence: u16,
}

/// Encode a command string for the vendor control characteristic
///
/// Commands are plain text without escaping or framing; the write primitive
/// carries the payload boundary.
#[must_use]
pub fn encode_command(command: &str) -> Bytes {
    Bytes::copy_from_slice(command.as_bytes())
}

/// Decode a power measurement notification
///
/// Layout:
/// - Bytes 0-1: flags (not interpreted)
/// - Bytes 2-3: instantaneous power (u16 little-endian, watts)
/// - Bytes 4-5: cadence (u16 little-endian, rpm)
///
/// # Errors
///
/// Returns [`PowerMeterError::MalformedPayload`] if the payload is shorter
/// than [`POWER_PAYLOAD_MIN`] bytes.
pub fn decode_power(data: &[u8]) -> Result<PowerReading> {
    if data.len() < POWER_PAYLOAD_MIN {
        return Err(PowerMeterError::MalformedPayload {
            kind: "power",
            len: data.len(),
            expected: POWER_PAYLOAD_MIN,
        });
    }

    let mut buf = data;
    buf.advance(2);
    let power = buf.get_u16_le();
    let cadence = buf.get_u16_le();

    Ok(PowerReading { power, cadence })
}

/// Decode a battery level notification into a percentage
///
/// # Errors
///
/// Returns [`PowerMeterError::MalformedPayload`] if the payload is empty.
pub fn decode_battery(data: &[u8]) -> Result<u8> {
    let mut buf = data;
    if buf.remaining() < BATTERY_PAYLOAD_MIN {
        return Err(PowerMeterError::MalformedPayload {
            kind: "battery",
            len: 0,
            expected: BATTERY_PAYLOAD_MIN,
        });
    }
    Ok(buf.get_u8())
}

/// Decode a vendor log notification
///
/// Invalid UTF-8 sequences are replaced with U+FFFD rather than rejected.
#[must_use]
pub fn decode_log(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}
