//! Fixed 16-byte packet header shared by every packet on the mesh.
//!
//! ```text
//! +--------+----------+-----------+
//! | type   | originId | timestamp |
//! | u32 BE | u32 BE   | u64 BE    |
//! +--------+----------+-----------+
//! ```
//!
//! The type tag is carried raw so that any 16-byte buffer decodes; the typed
//! packet layer is responsible for rejecting tags it does not know.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::WireError;

/// Packet header size in bytes
pub const PACKET_HEADER_SIZE: usize = 16;

/// Packet types as defined in the wire protocol
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Periodic presence announcement
    Heartbeat = 0,
    /// Reachability probe
    Ping = 1,
    /// Opaque application bytes
    RawBytes = 2,
    /// Application bytes addressed to a channel
    ChannelBytes = 3,
    /// Sender is leaving the mesh
    Disconnecting = 4,
}

impl TryFrom<u32> for PacketType {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Heartbeat),
            1 => Ok(PacketType::Ping),
            2 => Ok(PacketType::RawBytes),
            3 => Ok(PacketType::ChannelBytes),
            4 => Ok(PacketType::Disconnecting),
            _ => Err(WireError::UnknownPacketType(value)),
        }
    }
}

/// Packet header (16 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Raw type tag
    pub type_tag: u32,
    /// Sending node identifier
    pub origin_id: u32,
    /// Milliseconds since epoch; doubles as a message index
    pub timestamp: u64,
}

impl PacketHeader {
    /// Create a header stamped with the current time
    pub fn new(packet_type: PacketType, origin_id: u32) -> Self {
        Self::with_timestamp(packet_type, origin_id, now_millis())
    }

    /// Create a header with an explicit timestamp
    pub fn with_timestamp(packet_type: PacketType, origin_id: u32, timestamp: u64) -> Self {
        Self {
            type_tag: packet_type as u32,
            origin_id,
            timestamp,
        }
    }

    /// Validated packet type
    pub fn packet_type(&self) -> Result<PacketType, WireError> {
        PacketType::try_from(self.type_tag)
    }

    /// Set the packet type
    pub fn set_type(&mut self, packet_type: PacketType) {
        self.type_tag = packet_type as u32;
    }

    /// Set the origin node
    pub fn set_origin_id(&mut self, origin_id: u32) {
        self.origin_id = origin_id;
    }

    /// Set the timestamp
    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }

    /// Encode the header to bytes (big-endian)
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.type_tag);
        buf.put_u32(self.origin_id);
        buf.put_u64(self.timestamp);
    }

    /// Encode the header into a fresh 16-byte buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a header from exactly 16 bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != PACKET_HEADER_SIZE {
            return Err(WireError::MalformedHeader(bytes.len()));
        }

        let mut buf = bytes;
        let type_tag = buf.get_u32();
        let origin_id = buf.get_u32();
        let timestamp = buf.get_u64();

        Ok(Self {
            type_tag,
            origin_id,
            timestamp,
        })
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
