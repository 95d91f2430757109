//! SDR link lifecycle and the transport service for sdr-mesh.
//!
//! This crate sits between the packet codecs in `mesh-wire` and a radio on a
//! hardware bus. It discovers the radio, asks for permission to use it, opens
//! a duplex channel, and moves fragments across that channel while tracking
//! congestion.
//!
//! ## Features
//!
//! - **Link lifecycle**: discovery, permission, open, congestion, close
//! - **Transport worker**: one task owns all mutable state; callers enqueue
//! - **Reassembly housekeeping**: periodic sweeps report lost packets once
//! - **Status reporting**: listener callbacks plus a watchable snapshot
//! - **Simulated radio**: in-process duplex channels for tests and demos
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_link::{SimulatedRadio, TransportConfig, TransportService};
//! use mesh_wire::Packet;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let radio = Arc::new(SimulatedRadio::loopback(vec![SimulatedRadio::pluto_device()]));
//! let config = TransportConfig {
//!     node_id: 1001,
//!     ..TransportConfig::default()
//! };
//!
//! let (service, handle) = TransportService::new(config, radio)?;
//! let worker = service.spawn();
//!
//! handle.send_packet(&Packet::raw_bytes(1001, &b"hello"[..]))?;
//! println!("link state: {:?}", handle.link_state());
//!
//! handle.shutdown();
//! worker.await??;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod congestion;
pub mod connection;
pub mod error;
pub mod hardware;
pub mod keepalive;
pub mod listener;
pub mod location;
pub mod service;

// Re-export main types
pub use congestion::{CongestionConfig, CongestionTracker};
pub use connection::{LinkConnection, LinkEvent, LinkState};
pub use error::LinkError;
pub use hardware::{
    DeviceInfo, DuplexChannel, HardwareTransport, LinkStream, PermissionPolicy,
    PermissionResponder, SdrModel, SimulatedRadio,
};
pub use keepalive::{build_heartbeat, HeartbeatSchedule};
pub use listener::MeshStatusListener;
pub use location::{is_better_fix, PositionFix};
pub use service::{TransportConfig, TransportHandle, TransportService, TransportStats, TransportStatus};
