//! Frame layouts of the H806SB UDP protocol.
//!
//! | Frame              | Size | Bytes                                             |
//! |--------------------|------|---------------------------------------------------|
//! | Discovery query    | 2    | `AB 01`                                           |
//! | Discovery response | var  | `AB 02` + ASCII `PREFIX_HEXSERIAL\0`              |
//! | Control command    | 16   | `FB C1 CTR SPEED BRIGHT ONOFF 00 AE 00*4 S0..S3`  |
//! | Liveness probe     | 12   | `FB C1 00 02 00*4 S0..S3`                         |
//! | Liveness response  | >= 2 | `FB C0 ...`                                       |
//!
//! Nothing in here touches a socket.

use std::net::IpAddr;

use bytes::BufMut;

use crate::util::discovery::DeviceIdentity;
use crate::util::serial::{SerialNumber, SERIAL_LEN};

/// Port the device listens on for discovery, probes and commands.
pub const DEVICE_PORT: u16 = 4626;
/// Port the device sends its replies to.
pub const LISTEN_PORT: u16 = 4882;

/// Largest datagram read while waiting for a discovery response.
pub const DISCOVERY_BUFFER_SIZE: usize = 1024;
/// Largest datagram read while waiting for a liveness response.
pub const PROBE_BUFFER_SIZE: usize = 64;

pub const DISCOVERY_QUERY: [u8; 2] = [0xAB, 0x01];
pub const DISCOVERY_RESPONSE_HEADER: [u8; 2] = [0xAB, 0x02];
pub const COMMAND_HEADER: [u8; 2] = [0xFB, 0xC1];
pub const LIVENESS_RESPONSE_HEADER: [u8; 2] = [0xFB, 0xC0];

pub const CONTROL_PACKET_LEN: usize = 16;
pub const LIVENESS_PROBE_LEN: usize = 12;

pub const SPEED_MIN: i32 = 1;
pub const SPEED_MAX: i32 = 100;
pub const BRIGHTNESS_MIN: i32 = 0;
pub const BRIGHTNESS_MAX: i32 = 31;

const COUNTER_OFFSET: usize = 2;
const SPEED_OFFSET: usize = 3;
const BRIGHTNESS_OFFSET: usize = 4;
const ON_FLAG_OFFSET: usize = 5;
const SERIAL_OFFSET: usize = CONTROL_PACKET_LEN - SERIAL_LEN;

/// Base control frame. Speed 80, brightness 0, single file playback.
pub const CONTROL_TEMPLATE: [u8; CONTROL_PACKET_LEN] = [
    0xFB, 0xC1, // command header
    0x00, // counter
    0x50, // speed
    0x00, // brightness
    0x01, // on flag
    0x00, 0xAE, // fixed, meaning unknown
    0x00, 0x00, 0x00, 0x00, // fixed
    0x00, 0x00, 0x00, 0x00, // serial
];

/// Fills the variable fields of `template`.
///
/// Out-of-range speed and brightness are clamped rather than rejected, the
/// firmware does not tolerate values outside 1..=100 and 0..=31.
pub fn build_control_packet(
    template: &[u8; CONTROL_PACKET_LEN],
    counter: u8,
    speed: i32,
    brightness: i32,
    is_on: bool,
    serial: &SerialNumber,
) -> [u8; CONTROL_PACKET_LEN] {
    let mut packet = *template;
    packet[COUNTER_OFFSET] = counter;
    packet[SPEED_OFFSET] = speed.clamp(SPEED_MIN, SPEED_MAX) as u8;
    packet[BRIGHTNESS_OFFSET] = brightness.clamp(BRIGHTNESS_MIN, BRIGHTNESS_MAX) as u8;
    packet[ON_FLAG_OFFSET] = u8::from(is_on);
    packet[SERIAL_OFFSET..].copy_from_slice(&serial.wire_bytes());
    packet
}

pub fn build_liveness_probe(serial: &SerialNumber) -> [u8; LIVENESS_PROBE_LEN] {
    let mut packet = [0u8; LIVENESS_PROBE_LEN];
    let mut buf = &mut packet[..];
    buf.put_slice(&COMMAND_HEADER);
    buf.put_u8(0x00);
    buf.put_u8(0x02); // liveness opcode
    buf.put_u32(0); // reserved
    buf.put_slice(&serial.wire_bytes());
    packet
}

/// Decodes a discovery response received from `source`.
///
/// Anything that is not a well formed `AB 02 PREFIX_HEXSERIAL\0` reply yields
/// `None`, so foreign broadcast traffic never aborts a discovery.
pub fn parse_discovery_response(datagram: &[u8], source: IpAddr) -> Option<DeviceIdentity> {
    let body = datagram.strip_prefix(&DISCOVERY_RESPONSE_HEADER)?;
    let body = &body[..body.len().min(DISCOVERY_BUFFER_SIZE - DISCOVERY_RESPONSE_HEADER.len())];

    let name_end = body.iter().position(|&b| b == 0)?;
    let name_bytes = &body[..name_end];
    if !name_bytes.is_ascii() {
        return None;
    }
    let name = std::str::from_utf8(name_bytes).ok()?;

    let (_, serial_hex) = name.split_once('_')?;
    let serial_raw = hex::decode(serial_hex).ok()?;

    Some(DeviceIdentity::new(source, serial_raw, name.to_string()))
}

/// Whether `datagram` from `from` answers a liveness probe sent to `expected_host`.
///
/// The host is compared as an IP address when it parses as one (so `::1` and
/// `0:0:0:0:0:0:0:1` match) and as a literal string otherwise.
pub fn is_liveness_response(datagram: &[u8], from: IpAddr, expected_host: &str) -> bool {
    if !datagram.starts_with(&LIVENESS_RESPONSE_HEADER) {
        return false;
    }
    match expected_host.parse::<IpAddr>() {
        Ok(expected) => expected == from,
        Err(_) => from.to_string() == expected_host,
    }
}
