//! Heartbeat scheduling.
//!
//! A node with a heartbeat interval announces itself with an empty
//! heartbeat packet whenever the interval has elapsed since the last one.

use bytes::Bytes;
use mesh_wire::Packet;
use std::time::Duration;
use tokio::time::Instant;

/// Build an encoded heartbeat packet
pub fn build_heartbeat(node_id: u32) -> Bytes {
    Packet::heartbeat(node_id).encode()
}

/// Tracks when the next heartbeat is due
#[derive(Debug, Clone)]
pub struct HeartbeatSchedule {
    interval: Option<Duration>,
    last_sent: Option<Instant>,
}

impl HeartbeatSchedule {
    /// Create a schedule; `None` disables heartbeats
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    /// Whether a heartbeat should go out now
    pub fn is_due(&self, now: Instant) -> bool {
        match (self.interval, self.last_sent) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(interval), Some(last)) => now.saturating_duration_since(last) >= interval,
        }
    }

    /// Record that a heartbeat went out
    pub fn mark_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }
}
