//! Upstream status callbacks.
//!
//! Every callback is invoked from the transport worker, one at a time and in
//! the order events occurred. Implementations must not block.

use bytes::Bytes;
use std::fmt;

/// Receives link and packet events from the transport service
pub trait MeshStatusListener: Send + Sync + fmt::Debug {
    /// The SDR link opened
    fn on_connect(&self);

    /// The SDR link closed
    fn on_disconnect(&self);

    /// A complete, well-formed packet arrived
    fn on_packet_received(&self, packet: Bytes);

    /// A packet was lost (reassembly timeout, eviction, or link drop)
    fn on_packet_dropped(&self);

    /// The link reported an error
    fn on_connection_error(&self, message: &str);

    /// Human readable progress report
    fn on_status_message(&self, _message: &str) {}

    /// The SDR became usable or unusable
    fn on_ready(&self, _ready: bool) {}

    /// Radio command or console output arrived
    fn on_command_data(&self, _data: &[u8]) {}

    /// The link entered or left the congested state
    fn on_congestion(&self, _congested: bool) {}
}
