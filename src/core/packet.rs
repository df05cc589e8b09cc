//! Packet and segment framing.
//!
//! A lobby packet is a 40-byte [`PacketHeader`] followed by `count` segments,
//! each a 16-byte [`SegmentHeader`] plus payload. The header's declared size
//! always equals the header width plus the sum of all segment sizes — the
//! encoder stamps this and the receive loop trusts it to frame reads.

use bytes::{Buf, BufMut, BytesMut};

use crate::core::unix_time_millis;
use crate::error::{ProtocolError, Result};

/// Wire width of [`PacketHeader`].
pub const PACKET_HEADER_SIZE: usize = 40;

/// Wire width of [`SegmentHeader`].
pub const SEGMENT_HEADER_SIZE: usize = 16;

/// First marker stamped on serverbound packets that opt in.
pub const PACKET_MARKER_1: u64 = 0xE246_5DFF_41A0_5252;

/// Second marker stamped on serverbound packets that opt in.
pub const PACKET_MARKER_2: u64 = 0x75C4_997B_4D64_2A7F;

/// Connection type tag carried in the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionType {
    #[default]
    None,
    Zone,
    Chat,
    Lobby,
    /// Preserved for forward compatibility; never interpreted.
    Unknown(u16),
}

impl ConnectionType {
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Zone,
            2 => Self::Chat,
            3 => Self::Lobby,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::None => 0,
            Self::Zone => 1,
            Self::Chat => 2,
            Self::Lobby => 3,
            Self::Unknown(other) => other,
        }
    }
}

/// Segment type tag. Ipc and EncryptedData payloads are ciphertext once the
/// connection cipher is initialized; everything else is plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentType {
    SessionInit,
    Ipc,
    KeepAlive,
    KeepAlivePong,
    EncryptionInit,
    EncryptedData,
    Unknown(u16),
}

impl SegmentType {
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            1 => Self::SessionInit,
            3 => Self::Ipc,
            7 => Self::KeepAlive,
            8 => Self::KeepAlivePong,
            9 => Self::EncryptionInit,
            10 => Self::EncryptedData,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::SessionInit => 1,
            Self::Ipc => 3,
            Self::KeepAlive => 7,
            Self::KeepAlivePong => 8,
            Self::EncryptionInit => 9,
            Self::EncryptedData => 10,
            Self::Unknown(other) => other,
        }
    }

    /// Whether this segment's payload goes through the connection cipher.
    pub fn is_encrypted(self) -> bool {
        matches!(self, Self::Ipc | Self::EncryptedData)
    }
}

/// Compression type tag. Always `None` here; the interception/proxy variant
/// of this protocol is the only consumer of the other values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    #[default]
    None,
    Unknown(u16),
}

impl CompressionType {
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0 => Self::None,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::None => 0,
            Self::Unknown(other) => other,
        }
    }
}

/// Fixed 40-byte packet header.
///
/// Field offsets: marker1 @0, marker2 @8, timestamp @16, size @24,
/// connection_type @28, count @30, reserved @32, compression_type @34,
/// uncompressed_size @36.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub marker1: u64,
    pub marker2: u64,
    /// Milliseconds since the Unix epoch; zero when the sender opts out.
    pub timestamp_ms: u64,
    /// Total packet size: header plus all segments.
    pub size: u32,
    pub connection_type: ConnectionType,
    /// Number of segments that follow the header.
    pub count: u16,
    pub reserved: u16,
    pub compression_type: CompressionType,
    pub uncompressed_size: u32,
}

impl PacketHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(PACKET_HEADER_SIZE);
        buf.put_u64_le(self.marker1);
        buf.put_u64_le(self.marker2);
        buf.put_u64_le(self.timestamp_ms);
        buf.put_u32_le(self.size);
        buf.put_u16_le(self.connection_type.to_u16());
        buf.put_u16_le(self.count);
        buf.put_u16_le(self.reserved);
        buf.put_u16_le(self.compression_type.to_u16());
        buf.put_u32_le(self.uncompressed_size);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::size_mismatch(
                "packet header",
                PACKET_HEADER_SIZE,
                buf.len(),
            ));
        }
        Ok(Self {
            marker1: buf.get_u64_le(),
            marker2: buf.get_u64_le(),
            timestamp_ms: buf.get_u64_le(),
            size: buf.get_u32_le(),
            connection_type: ConnectionType::from_u16(buf.get_u16_le()),
            count: buf.get_u16_le(),
            reserved: buf.get_u16_le(),
            compression_type: CompressionType::from_u16(buf.get_u16_le()),
            uncompressed_size: buf.get_u32_le(),
        })
    }
}

/// Fixed 16-byte segment header. `size` covers the header itself plus the
/// payload that follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub size: u32,
    pub source_actor: u32,
    pub target_actor: u32,
    pub segment_type: SegmentType,
    pub reserved: u16,
}

impl SegmentHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(SEGMENT_HEADER_SIZE);
        buf.put_u32_le(self.size);
        buf.put_u32_le(self.source_actor);
        buf.put_u32_le(self.target_actor);
        buf.put_u16_le(self.segment_type.to_u16());
        buf.put_u16_le(self.reserved);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < SEGMENT_HEADER_SIZE {
            return Err(ProtocolError::size_mismatch(
                "segment header",
                SEGMENT_HEADER_SIZE,
                buf.len(),
            ));
        }
        Ok(Self {
            size: buf.get_u32_le(),
            source_actor: buf.get_u32_le(),
            target_actor: buf.get_u32_le(),
            segment_type: SegmentType::from_u16(buf.get_u16_le()),
            reserved: buf.get_u16_le(),
        })
    }

    /// Payload byte count implied by the declared size. Errors if the size
    /// is smaller than the header itself — that is a framing desync.
    pub fn payload_len(&self) -> Result<usize> {
        (self.size as usize).checked_sub(SEGMENT_HEADER_SIZE).ok_or_else(|| {
            ProtocolError::Decode(format!(
                "segment size {} smaller than header width {SEGMENT_HEADER_SIZE}",
                self.size
            ))
        })
    }
}

/// One segment: addressing, type tag, and payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub source_actor: u32,
    pub target_actor: u32,
    pub segment_type: SegmentType,
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn new(segment_type: SegmentType, payload: Vec<u8>) -> Self {
        Self {
            source_actor: 0,
            target_actor: 0,
            segment_type,
            payload,
        }
    }

    pub fn addressed(segment_type: SegmentType, actor: u32, payload: Vec<u8>) -> Self {
        Self {
            source_actor: actor,
            target_actor: actor,
            segment_type,
            payload,
        }
    }

    /// Total wire size of this segment.
    pub fn wire_size(&self) -> usize {
        SEGMENT_HEADER_SIZE + self.payload.len()
    }

    pub fn header(&self) -> SegmentHeader {
        SegmentHeader {
            size: self.wire_size() as u32,
            source_actor: self.source_actor,
            target_actor: self.target_actor,
            segment_type: self.segment_type,
            reserved: 0,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        self.header().encode(buf);
        buf.put_slice(&self.payload);
    }
}

/// A full packet ready to encode, or the result of decoding one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub segments: Vec<Segment>,
}

impl Packet {
    /// Build a packet without markers or timestamp (pings, cipher init).
    pub fn new(connection_type: ConnectionType, segments: Vec<Segment>) -> Self {
        Self::build(connection_type, segments, false)
    }

    /// Build a packet with the marker constants and a millisecond timestamp
    /// stamped into the header, as serverbound IPC packets require.
    pub fn stamped(connection_type: ConnectionType, segments: Vec<Segment>) -> Self {
        Self::build(connection_type, segments, true)
    }

    fn build(connection_type: ConnectionType, segments: Vec<Segment>, stamp: bool) -> Self {
        let total: usize = segments.iter().map(Segment::wire_size).sum();
        let header = PacketHeader {
            marker1: if stamp { PACKET_MARKER_1 } else { 0 },
            marker2: if stamp { PACKET_MARKER_2 } else { 0 },
            timestamp_ms: if stamp { unix_time_millis() } else { 0 },
            size: (PACKET_HEADER_SIZE + total) as u32,
            connection_type,
            count: segments.len() as u16,
            reserved: 1,
            compression_type: CompressionType::None,
            uncompressed_size: 0,
        };
        Self { header, segments }
    }

    /// Serialize into one contiguous buffer: header then each segment.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.header.size as usize);
        self.header.encode(&mut buf);
        for segment in &self.segments {
            segment.encode(&mut buf);
        }
        buf
    }

    /// Decode a whole packet from a contiguous buffer. The transport frames
    /// directly off the stream instead; this is the slice-based counterpart
    /// used by tests and tools.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = PacketHeader::decode(buf)?;
        let mut offset = PACKET_HEADER_SIZE;
        let mut segments = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            let seg_header = SegmentHeader::decode(&buf[offset.min(buf.len())..])?;
            let payload_len = seg_header.payload_len()?;
            let start = offset + SEGMENT_HEADER_SIZE;
            let end = start + payload_len;
            if buf.len() < end {
                return Err(ProtocolError::size_mismatch(
                    "segment payload",
                    payload_len,
                    buf.len().saturating_sub(start),
                ));
            }
            segments.push(Segment {
                source_actor: seg_header.source_actor,
                target_actor: seg_header.target_actor,
                segment_type: seg_header.segment_type,
                payload: buf[start..end].to_vec(),
            });
            offset = end;
        }
        if header.size as usize != offset {
            return Err(ProtocolError::Decode(format!(
                "packet declares {} bytes but segments end at {offset}",
                header.size
            )));
        }
        Ok(Self { header, segments })
    }
}
