//! Framing for the byte-oriented radio channel.
//!
//! The channel is a byte stream, so each burst is delimited:
//!
//! ```text
//! +-----------+-----------+----------+---------+
//! | sync 0xA5 | kind u8   | len u16  | payload |
//! +-----------+-----------+----------+---------+
//! ```
//!
//! `kind` separates mesh data from the radio's own command/console output.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

/// Sync byte opening every link frame
pub const LINK_SYNC: u8 = 0xA5;

/// Link frame header size in bytes
pub const LINK_HEADER_SIZE: usize = 4;

/// Largest payload one link frame can carry
pub const MAX_LINK_PAYLOAD: usize = u16::MAX as usize;

/// What a link frame carries
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFrameKind {
    /// Mesh fragment
    Data = 0x01,
    /// Radio command or console output
    Command = 0x02,
}

impl LinkFrameKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(LinkFrameKind::Data),
            0x02 => Some(LinkFrameKind::Command),
            _ => None,
        }
    }
}

/// One delimited burst on the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFrame {
    /// Frame kind
    pub kind: LinkFrameKind,
    /// Frame payload
    pub payload: Bytes,
}

impl LinkFrame {
    /// Data frame
    pub fn data(payload: Bytes) -> Self {
        Self {
            kind: LinkFrameKind::Data,
            payload,
        }
    }

    /// Command frame
    pub fn command(payload: Bytes) -> Self {
        Self {
            kind: LinkFrameKind::Command,
            payload,
        }
    }

    /// Encode to a contiguous buffer; `None` if the payload exceeds
    /// [`MAX_LINK_PAYLOAD`]
    pub fn encode(&self) -> Option<Bytes> {
        if self.payload.len() > MAX_LINK_PAYLOAD {
            return None;
        }

        let mut buf = BytesMut::with_capacity(LINK_HEADER_SIZE + self.payload.len());
        buf.put_u8(LINK_SYNC);
        buf.put_u8(self.kind as u8);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        Some(buf.freeze())
    }
}

/// Incremental link frame decoder
#[derive(Debug)]
pub struct LinkFrameDecoder {
    max_payload: usize,
    discarded: u64,
}

impl LinkFrameDecoder {
    /// Create a decoder accepting any payload a link frame can carry
    pub fn new() -> Self {
        Self::with_max_payload(MAX_LINK_PAYLOAD)
    }

    /// Create a decoder that treats longer length fields as corruption
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(MAX_LINK_PAYLOAD),
            discarded: 0,
        }
    }

    /// Largest payload this decoder accepts
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Total bytes skipped while resynchronising
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    /// Decode one frame from the buffer, or `None` if more bytes are needed.
    ///
    /// Garbage ahead of a frame is skipped up to the next sync byte, and so is
    /// a header whose length exceeds the payload cap.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Option<LinkFrame> {
        loop {
            self.resync(buf);

            if buf.len() < LINK_HEADER_SIZE {
                return None;
            }

            let Some(kind) = LinkFrameKind::from_u8(buf[1]) else {
                // Sync byte inside garbage; skip it and search again
                self.skip(buf, 1);
                continue;
            };

            let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            if len > self.max_payload {
                warn!(
                    "Link frame length {} exceeds cap {}, resynchronising",
                    len, self.max_payload
                );
                self.skip(buf, 1);
                continue;
            }
            if buf.len() < LINK_HEADER_SIZE + len {
                return None;
            }

            buf.advance(LINK_HEADER_SIZE);
            let payload = buf.split_to(len).freeze();
            return Some(LinkFrame { kind, payload });
        }
    }

    fn resync(&mut self, buf: &mut BytesMut) {
        if buf.first() == Some(&LINK_SYNC) || buf.is_empty() {
            return;
        }

        let skip = buf
            .iter()
            .position(|b| *b == LINK_SYNC)
            .unwrap_or(buf.len());
        self.skip(buf, skip);
    }

    fn skip(&mut self, buf: &mut BytesMut, n: usize) {
        warn!("Discarding {} unframed byte(s) from link", n);
        buf.advance(n);
        self.discarded += n as u64;
    }
}

impl Default for LinkFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
