use std::fmt::{Display, Formatter};

use log::debug;

use crate::error::{ControlError, Result};

/// Width of the serial field inside control and probe packets.
pub const SERIAL_LEN: usize = 4;

/// A device serial in the byte order the firmware expects on the wire.
///
/// The device advertises its serial big-endian (e.g. `0C3951` in `HC1_0C3951`),
/// but every packet sent to it carries the serial left-padded to four bytes and
/// reversed: `0C3951` becomes `51 39 0C 00`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SerialNumber([u8; SERIAL_LEN]);

impl SerialNumber {
    /// Encodes a hex serial, as typed by a user or found in a device name.
    pub fn from_hex(serial: &str) -> Result<Self> {
        let raw = hex::decode(serial.trim())
            .map_err(|e| ControlError::InvalidSerialFormat(format!("{serial:?}: {e}")))?;
        Self::from_raw(&raw)
    }

    /// Encodes the big-endian serial bytes carried by a discovery response.
    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        if raw.len() > SERIAL_LEN {
            return Err(ControlError::SerialTooLong(raw.len()));
        }

        let mut wire = [0u8; SERIAL_LEN];
        wire[SERIAL_LEN - raw.len()..].copy_from_slice(raw);
        debug!("Padded serial: {}", hex::encode_upper(wire));
        wire.reverse();

        Ok(SerialNumber(wire))
    }

    /// The four bytes exactly as they are embedded in packets.
    pub fn wire_bytes(&self) -> [u8; SERIAL_LEN] {
        self.0
    }
}

impl From<[u8; SERIAL_LEN]> for SerialNumber {
    /// Wraps bytes that are already in wire order.
    fn from(wire: [u8; SERIAL_LEN]) -> Self {
        SerialNumber(wire)
    }
}

impl Display for SerialNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_serial_is_padded_then_reversed() {
        let serial = SerialNumber::from_hex("0C3951").unwrap();
        assert_eq!(serial.wire_bytes(), [0x51, 0x39, 0x0C, 0x00]);
    }

    #[test]
    fn test_full_length_serial_is_reversed() {
        let serial = SerialNumber::from_hex("AABBCCDD").unwrap();
        assert_eq!(serial.wire_bytes(), [0xDD, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn test_lowercase_and_whitespace() {
        let serial = SerialNumber::from_hex(" 0c3951\n").unwrap();
        assert_eq!(serial.wire_bytes(), [0x51, 0x39, 0x0C, 0x00]);
    }

    #[test]
    fn test_single_byte_serial() {
        let serial = SerialNumber::from_hex("7F").unwrap();
        assert_eq!(serial.wire_bytes(), [0x7F, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_empty_serial_is_all_zero() {
        let serial = SerialNumber::from_hex("").unwrap();
        assert_eq!(serial, SerialNumber::default());
    }

    #[test]
    fn test_five_byte_serial_is_rejected() {
        let err = SerialNumber::from_hex("AABBCCDDEE").unwrap_err();
        assert!(matches!(err, ControlError::SerialTooLong(5)));
    }

    #[test]
    fn test_non_hex_serial_is_rejected() {
        let err = SerialNumber::from_hex("ZZ").unwrap_err();
        assert!(matches!(err, ControlError::InvalidSerialFormat(_)));
    }

    #[test]
    fn test_odd_length_serial_is_rejected() {
        let err = SerialNumber::from_hex("ABCDE").unwrap_err();
        assert!(matches!(err, ControlError::InvalidSerialFormat(_)));
    }

    #[test]
    fn test_encoding_is_repeatable() {
        let first = SerialNumber::from_hex("0C3951").unwrap();
        let second = SerialNumber::from_hex("0C3951").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_from_raw_matches_from_hex() {
        let raw = SerialNumber::from_raw(&[0x0C, 0x39, 0x51]).unwrap();
        assert_eq!(raw, SerialNumber::from_hex("0C3951").unwrap());
    }

    #[test]
    fn test_display_is_wire_order() {
        let serial = SerialNumber::from_hex("0C3951").unwrap();
        assert_eq!(serial.to_string(), "51390C00");
    }
}
