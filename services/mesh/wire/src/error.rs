//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Header slice is not exactly 16 bytes
    #[error("malformed header: {0} bytes (16 expected)")]
    MalformedHeader(usize),

    /// Type tag outside the recognized packet set
    #[error("unknown packet type {0}")]
    UnknownPacketType(u32),

    /// Body length inconsistent with the packet type
    #[error("truncated body: expected {expected} bytes, got {actual}")]
    TruncatedBody {
        /// Body length required by the packet type
        expected: usize,
        /// Body length actually present
        actual: usize,
    },

    /// Payload would need more fragments than the protocol allows
    #[error("payload too large: {len} bytes needs {count} fragments (max {max})")]
    PayloadTooLarge {
        /// Payload length in bytes
        len: usize,
        /// Fragments the payload would need
        count: usize,
        /// Maximum fragments per group
        max: usize,
    },

    /// MTU cannot carry a fragment header plus payload
    #[error("mtu {0} below minimum")]
    MtuTooSmall(usize),

    /// Fragment header or length fields are inconsistent
    #[error("malformed fragment: {0}")]
    MalformedFragment(&'static str),

    /// Fragment payload CRC mismatch
    #[error("fragment checksum mismatch")]
    FragmentChecksum,
}
