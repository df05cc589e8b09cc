//! IPC message envelope.
//!
//! Ipc segments carry a fixed 16-byte [`IpcHeader`] followed by an
//! opcode-specific payload. The header travels inside the enciphered portion
//! of the segment, so parsing happens after decryption.

use bytes::{Buf, BufMut, BytesMut};

use crate::core::unix_time_secs;
use crate::error::{ProtocolError, Result};

/// Wire width of [`IpcHeader`].
pub const IPC_HEADER_SIZE: usize = 16;

/// Constant the server expects in the first header field of every IPC.
pub const IPC_SENTINEL: u16 = 20;

/// Fixed 16-byte IPC header. Reserved fields are preserved as-is on decode
/// and zeroed on encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcHeader {
    pub reserved0: u16,
    pub opcode: u16,
    pub reserved4: u16,
    pub server_id: u16,
    /// Seconds since the Unix epoch.
    pub timestamp: u32,
    pub reserved12: u32,
}

impl IpcHeader {
    /// Header for a serverbound message: sentinel set, current timestamp.
    pub fn serverbound(opcode: u16) -> Self {
        Self {
            reserved0: IPC_SENTINEL,
            opcode,
            reserved4: 0,
            server_id: 0,
            timestamp: unix_time_secs(),
            reserved12: 0,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(IPC_HEADER_SIZE);
        buf.put_u16_le(self.reserved0);
        buf.put_u16_le(self.opcode);
        buf.put_u16_le(self.reserved4);
        buf.put_u16_le(self.server_id);
        buf.put_u32_le(self.timestamp);
        buf.put_u32_le(self.reserved12);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < IPC_HEADER_SIZE {
            return Err(ProtocolError::size_mismatch(
                "ipc header",
                IPC_HEADER_SIZE,
                buf.len(),
            ));
        }
        Ok(Self {
            reserved0: buf.get_u16_le(),
            opcode: buf.get_u16_le(),
            reserved4: buf.get_u16_le(),
            server_id: buf.get_u16_le(),
            timestamp: buf.get_u32_le(),
            reserved12: buf.get_u32_le(),
        })
    }
}

/// A decoded clientbound IPC: header plus the opcode-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcMessage {
    pub header: IpcHeader,
    pub data: Vec<u8>,
}

impl IpcMessage {
    /// Split a decrypted Ipc segment payload into header and data.
    pub fn from_segment_payload(payload: &[u8]) -> Result<Self> {
        let header = IpcHeader::decode(payload)?;
        Ok(Self {
            header,
            data: payload[IPC_HEADER_SIZE..].to_vec(),
        })
    }

    pub fn opcode(&self) -> u16 {
        self.header.opcode
    }
}

/// Prepend a serverbound [`IpcHeader`] to an opcode payload. The result is
/// the plaintext segment payload, ready for the connection cipher.
pub fn encode_ipc(opcode: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(IPC_HEADER_SIZE + payload.len());
    IpcHeader::serverbound(opcode).encode(&mut buf);
    buf.put_slice(payload);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = IpcHeader {
            reserved0: IPC_SENTINEL,
            opcode: 12,
            reserved4: 0,
            server_id: 69,
            timestamp: 1_700_000_000,
            reserved12: 0,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), IPC_HEADER_SIZE);
        assert_eq!(IpcHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn encode_ipc_stamps_sentinel_and_opcode() {
        let bytes = encode_ipc(5, &[0xAB; 24]);
        assert_eq!(bytes.len(), IPC_HEADER_SIZE + 24);
        let msg = IpcMessage::from_segment_payload(&bytes).unwrap();
        assert_eq!(msg.header.reserved0, IPC_SENTINEL);
        assert_eq!(msg.opcode(), 5);
        assert_eq!(msg.data, vec![0xAB; 24]);
    }

    #[test]
    fn short_payload_is_a_decode_error() {
        assert!(IpcMessage::from_segment_payload(&[0u8; 8]).is_err());
    }
}
