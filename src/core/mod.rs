//! Binary framing for the lobby wire protocol.
//!
//! Everything on the wire is little-endian and byte-packed; every structure
//! here is encoded and decoded field by field at documented offsets rather
//! than by reinterpreting raw memory.

pub mod ipc;
pub mod packet;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, for packet header timestamps.
/// A clock before the epoch stamps zero rather than failing the send path.
pub(crate) fn unix_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch, for IPC header and ping timestamps.
pub(crate) fn unix_time_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Read a NUL-terminated string out of a fixed-width field, lossily decoding
/// as UTF-8. The server pads these fields with zero bytes.
pub(crate) fn read_fixed_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Write an ASCII string into a fixed-width zero-padded field. Returns the
/// number of bytes written, or `None` if the string does not fit.
pub(crate) fn write_fixed_ascii(field: &mut [u8], value: &str) -> Option<usize> {
    let bytes = value.as_bytes();
    if bytes.len() > field.len() {
        return None;
    }
    field[..bytes.len()].copy_from_slice(bytes);
    Some(bytes.len())
}
