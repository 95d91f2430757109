//! Packet framing, segmentation/reassembly, and link framing for sdr-mesh.
//!
//! This crate provides the byte-level protocol shared by every node on the
//! mesh: the fixed packet header, typed packet bodies, the SAR protocol that
//! fits payloads into a small radio MTU, and the framing that delimits bursts
//! on the radio's byte stream.
//!
//! ## Wire Format
//!
//! ```text
//! +--------------------------+-------------------------------+
//! | link frame header (4B)   | sync, kind, u16 length        |
//! +--------------------------+-------------------------------+
//! | fragment header (16B)    | origin, group, index, count,  |
//! |                          | payload length, crc32         |
//! +--------------------------+-------------------------------+
//! | fragment payload         | slice of one encoded packet:  |
//! |                          |   packet header (16B) + body  |
//! +--------------------------+-------------------------------+
//! ```
//!
//! All integers are big-endian.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod header;
pub mod link;
pub mod packet;
pub mod segment;

// Re-export main types
pub use error::WireError;
pub use header::{now_millis, PacketHeader, PacketType, PACKET_HEADER_SIZE};
pub use link::{
    LinkFrame, LinkFrameDecoder, LinkFrameKind, LINK_HEADER_SIZE, LINK_SYNC, MAX_LINK_PAYLOAD,
};
pub use packet::{Packet, PacketBody, PING_BODY_SIZE};
pub use segment::{
    Fragment, GroupKey, Reassembler, Segmenter, Segments, SweepReport, FRAGMENT_HEADER_SIZE,
    MAX_FRAGMENT_COUNT, MIN_MTU,
};
