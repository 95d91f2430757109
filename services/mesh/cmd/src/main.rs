//! SDR mesh node binary.
//!
//! Runs one transport service against a simulated PlutoSDR in loopback mode,
//! sends a demo packet once the link is ready, and logs every listener event.

use bytes::Bytes;
use clap::Parser;
use mesh_link::{
    LinkState, MeshStatusListener, SimulatedRadio, TransportHandle, TransportService,
};
use mesh_wire::{Packet, PacketBody};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::MeshConfig;
use logging::MeshLogFormatter;

const DEMO_MESSAGE: &str = "Mr. Watson — Come here — I want to see you";

/// SDR mesh transport node
#[derive(Parser, Debug)]
#[command(name = "sdr-mesh", version, about = "SDR mesh transport node")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "sdr-mesh.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Node ID, overrides the config file
    #[arg(long)]
    node_id: Option<u32>,

    /// Largest encoded fragment in bytes, overrides the config file
    #[arg(long)]
    mtu: Option<usize>,

    /// Reassembly timeout, e.g. 5s
    #[arg(long)]
    reassembly_timeout: Option<humantime::Duration>,

    /// Heartbeat interval, e.g. 10s
    #[arg(long)]
    heartbeat_interval: Option<humantime::Duration>,

    /// Resend the demo packet at this interval, e.g. 30s
    #[arg(long)]
    demo_interval: Option<humantime::Duration>,
}

/// Logs every transport event
#[derive(Debug)]
struct LoggingListener;

impl MeshStatusListener for LoggingListener {
    fn on_connect(&self) {
        component_info!("listener", "SDR connected");
    }

    fn on_disconnect(&self) {
        component_info!("listener", "SDR disconnected");
    }

    fn on_packet_received(&self, packet: Bytes) {
        match Packet::decode(&packet) {
            Ok(packet) => match &packet.body {
                PacketBody::RawBytes(data) | PacketBody::ChannelBytes(data) => component_info!(
                    "listener",
                    "Packet from node {}: {}",
                    packet.header.origin_id,
                    String::from_utf8_lossy(data)
                ),
                body => component_info!(
                    "listener",
                    "Packet from node {}: {:?}",
                    packet.header.origin_id,
                    body
                ),
            },
            Err(e) => component_warn!("listener", "Undecodable packet of {}b: {}", packet.len(), e),
        }
    }

    fn on_packet_dropped(&self) {
        component_warn!("listener", "Packet dropped");
    }

    fn on_connection_error(&self, message: &str) {
        component_error!("listener", "Connection error: {}", message);
    }

    fn on_status_message(&self, message: &str) {
        component_info!("listener", "Status: {}", message);
    }

    fn on_ready(&self, ready: bool) {
        component_debug!("listener", "Ready: {}", ready);
    }

    fn on_command_data(&self, data: &[u8]) {
        component_info!("listener", "Radio: {}", String::from_utf8_lossy(data));
    }

    fn on_congestion(&self, congested: bool) {
        if congested {
            component_warn!("listener", "Link congested");
        } else {
            component_info!("listener", "Link congestion cleared");
        }
    }
}

/// Send the demo packet once the link is ready, then every `interval`
async fn run_demo(handle: TransportHandle, node_id: u32, interval: Option<Duration>) -> anyhow::Result<()> {
    let mut status = handle.subscribe();
    status
        .wait_for(|s| s.link_state.map_or(false, LinkState::can_send))
        .await?;

    loop {
        let packet = Packet::raw_bytes(node_id, Bytes::from_static(DEMO_MESSAGE.as_bytes()));
        handle.send_packet(&packet)?;
        component_info!("demo", "Sent demo packet ({}b)", packet.encoded_size());

        match interval {
            Some(interval) => tokio::time::sleep(interval).await,
            None => return Ok(()),
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("sdr_mesh={}", args.log_level).parse()?)
        .add_directive(format!("mesh_link={}", args.log_level).parse()?)
        .add_directive(format!("mesh_wire={}", args.log_level).parse()?);

    let formatter = MeshLogFormatter::new("sdr-mesh");

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(formatter)
        .init();

    info!("Starting SDR mesh node v{}", env!("CARGO_PKG_VERSION"));

    let mut mesh_config = MeshConfig::load_from_file(&args.config)?;
    if let Some(node_id) = args.node_id {
        mesh_config.node_id = node_id;
    }
    if let Some(mtu) = args.mtu {
        mesh_config.mtu = mtu;
    }
    if let Some(timeout) = args.reassembly_timeout {
        mesh_config.reassembly_timeout = timeout.into();
    }
    if let Some(interval) = args.heartbeat_interval {
        mesh_config.heartbeat_interval = Some(interval.into());
    }

    let node_id = mesh_config.node_id;
    let radio = Arc::new(SimulatedRadio::loopback(vec![SimulatedRadio::pluto_device()]));
    let (mut service, handle) = TransportService::new(mesh_config.transport_config(), radio)?;
    service.set_listener(Arc::new(LoggingListener));
    let worker = service.spawn();

    let demo_handle = handle.clone();
    let demo_interval = args.demo_interval.map(Duration::from);
    let demo = tokio::spawn(async move {
        if let Err(e) = run_demo(demo_handle, node_id, demo_interval).await {
            component_warn!("demo", "Demo stopped: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");

    demo.abort();
    handle.shutdown();
    worker.await??;

    let stats = serde_json::to_string(&handle.status().stats)?;
    info!("Final transport stats: {}", stats);

    Ok(())
}
