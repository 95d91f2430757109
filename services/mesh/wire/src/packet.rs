//! Typed packets: a [`PacketHeader`] followed by a type-specific body.
//!
//! This layer is a pure transform and holds no state, so it can be used from
//! any thread on independent buffers.

use bytes::{BufMut, Bytes, BytesMut};

use crate::header::{PacketHeader, PacketType, PACKET_HEADER_SIZE};
use crate::WireError;

/// Ping body size (u32 sequence number)
pub const PING_BODY_SIZE: usize = 4;

/// Type-specific packet body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    /// Empty body
    Heartbeat,
    /// Sequence number chosen by the sender
    Ping {
        /// Probe sequence number
        seq: u32,
    },
    /// Opaque payload, carried verbatim
    RawBytes(Bytes),
    /// Channel payload, carried verbatim
    ChannelBytes(Bytes),
    /// Empty body
    Disconnecting,
}

impl PacketBody {
    /// Packet type this body belongs to
    pub fn packet_type(&self) -> PacketType {
        match self {
            PacketBody::Heartbeat => PacketType::Heartbeat,
            PacketBody::Ping { .. } => PacketType::Ping,
            PacketBody::RawBytes(_) => PacketType::RawBytes,
            PacketBody::ChannelBytes(_) => PacketType::ChannelBytes,
            PacketBody::Disconnecting => PacketType::Disconnecting,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            PacketBody::Heartbeat | PacketBody::Disconnecting => 0,
            PacketBody::Ping { .. } => PING_BODY_SIZE,
            PacketBody::RawBytes(data) | PacketBody::ChannelBytes(data) => data.len(),
        }
    }
}

/// Header plus body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet header
    pub header: PacketHeader,
    /// Packet body
    pub body: PacketBody,
}

impl Packet {
    /// Build a packet for `origin_id` stamped with the current time.
    ///
    /// The header's type tag always follows the body.
    pub fn new(origin_id: u32, body: PacketBody) -> Self {
        Self {
            header: PacketHeader::new(body.packet_type(), origin_id),
            body,
        }
    }

    /// Heartbeat packet
    pub fn heartbeat(origin_id: u32) -> Self {
        Self::new(origin_id, PacketBody::Heartbeat)
    }

    /// Ping packet
    pub fn ping(origin_id: u32, seq: u32) -> Self {
        Self::new(origin_id, PacketBody::Ping { seq })
    }

    /// Raw bytes packet
    pub fn raw_bytes(origin_id: u32, data: impl Into<Bytes>) -> Self {
        Self::new(origin_id, PacketBody::RawBytes(data.into()))
    }

    /// Channel bytes packet
    pub fn channel_bytes(origin_id: u32, data: impl Into<Bytes>) -> Self {
        Self::new(origin_id, PacketBody::ChannelBytes(data.into()))
    }

    /// Disconnect notice
    pub fn disconnecting(origin_id: u32) -> Self {
        Self::new(origin_id, PacketBody::Disconnecting)
    }

    /// Validated packet type
    pub fn packet_type(&self) -> PacketType {
        self.body.packet_type()
    }

    /// Application payload carried by the packet, if any
    pub fn payload(&self) -> Option<&Bytes> {
        match &self.body {
            PacketBody::RawBytes(data) | PacketBody::ChannelBytes(data) => Some(data),
            _ => None,
        }
    }

    /// Total encoded size
    pub fn encoded_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.body.encoded_len()
    }

    /// Encode header followed by body
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());

        let mut header = self.header;
        header.set_type(self.body.packet_type());
        header.encode(&mut buf);

        match &self.body {
            PacketBody::Heartbeat | PacketBody::Disconnecting => {}
            PacketBody::Ping { seq } => buf.put_u32(*seq),
            PacketBody::RawBytes(data) | PacketBody::ChannelBytes(data) => buf.put_slice(data),
        }

        buf.freeze()
    }

    /// Decode a packet from a complete buffer
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(WireError::MalformedHeader(bytes.len()));
        }

        let (head, rest) = bytes.split_at(PACKET_HEADER_SIZE);
        let header = PacketHeader::decode(head)?;

        let body = match header.packet_type()? {
            PacketType::Heartbeat => {
                expect_len(rest, 0)?;
                PacketBody::Heartbeat
            }
            PacketType::Ping => {
                expect_len(rest, PING_BODY_SIZE)?;
                let seq = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
                PacketBody::Ping { seq }
            }
            PacketType::RawBytes => PacketBody::RawBytes(Bytes::copy_from_slice(rest)),
            PacketType::ChannelBytes => PacketBody::ChannelBytes(Bytes::copy_from_slice(rest)),
            PacketType::Disconnecting => {
                expect_len(rest, 0)?;
                PacketBody::Disconnecting
            }
        };

        Ok(Self { header, body })
    }
}

fn expect_len(body: &[u8], expected: usize) -> Result<(), WireError> {
    if body.len() != expected {
        return Err(WireError::TruncatedBody {
            expected,
            actual: body.len(),
        });
    }
    Ok(())
}
