//! Configuration handling for the sdr-mesh node.
//!
//! Settings come from a YAML file, then environment variables, then command
//! line flags (applied by `main`).

use anyhow::Result;
use mesh_link::{CongestionConfig, TransportConfig};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Node configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MeshConfig {
    /// Node id stamped on every fragment
    pub node_id: u32,
    /// Largest encoded fragment
    pub mtu: usize,
    /// Housekeeping period
    pub housekeeping_interval: Duration,
    /// Incomplete group lifetime
    pub reassembly_timeout: Duration,
    /// Incomplete groups held at once
    pub max_pending_groups: usize,
    /// Heartbeat period, if any
    pub heartbeat_interval: Option<Duration>,
    /// Link congestion thresholds
    pub congestion: CongestionConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            node_id: 1001,
            mtu: transport.mtu,
            housekeeping_interval: transport.housekeeping_interval,
            reassembly_timeout: transport.reassembly_timeout,
            max_pending_groups: transport.max_pending_groups,
            heartbeat_interval: transport.heartbeat_interval,
            congestion: transport.congestion,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Default, Deserialize)]
struct RootConfig {
    node: Option<NodeSection>,
    link: Option<LinkSection>,
    transport: Option<TransportSection>,
}

#[derive(Debug, Deserialize)]
struct NodeSection {
    id: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct LinkSection {
    max_queue_bytes: Option<usize>,
    max_latency: Option<String>,
    sample_window: Option<usize>,
    recent_window: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransportSection {
    mtu: Option<usize>,
    housekeeping_interval: Option<String>,
    reassembly_timeout: Option<String>,
    max_pending_groups: Option<usize>,
    heartbeat_interval: Option<String>,
}

impl MeshConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config)?;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?} ({}), using defaults",
                        config_path.as_ref(),
                        e
                    );
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", config_path.as_ref());
            }
        }

        config.apply_environment_overrides(|key| std::env::var(key).ok());

        info!(
            "Final mesh configuration: node_id={}, mtu={}, reassembly_timeout={:?}",
            config.node_id, config.mtu, config.reassembly_timeout
        );

        Ok(config)
    }

    /// Settings for the transport service
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            node_id: self.node_id,
            mtu: self.mtu,
            housekeeping_interval: self.housekeeping_interval,
            reassembly_timeout: self.reassembly_timeout,
            max_pending_groups: self.max_pending_groups,
            heartbeat_interval: self.heartbeat_interval,
            congestion: self.congestion.clone(),
        }
    }

    fn apply_root_config(&mut self, root_config: RootConfig) -> Result<()> {
        if let Some(node) = root_config.node {
            if let Some(id) = node.id {
                self.node_id = id;
            }
        }

        if let Some(link) = root_config.link {
            if let Some(bytes) = link.max_queue_bytes {
                self.congestion.max_queue_bytes = bytes;
            }
            if let Some(latency) = link.max_latency {
                self.congestion.max_latency = parse_duration("link.max_latency", &latency)?;
            }
            if let Some(window) = link.sample_window {
                self.congestion.sample_window = window;
            }
            if let Some(window) = link.recent_window {
                self.congestion.recent_window = parse_duration("link.recent_window", &window)?;
            }
        }

        if let Some(transport) = root_config.transport {
            if let Some(mtu) = transport.mtu {
                self.mtu = mtu;
            }
            if let Some(interval) = transport.housekeeping_interval {
                self.housekeeping_interval =
                    parse_duration("transport.housekeeping_interval", &interval)?;
            }
            if let Some(timeout) = transport.reassembly_timeout {
                self.reassembly_timeout = parse_duration("transport.reassembly_timeout", &timeout)?;
            }
            if let Some(groups) = transport.max_pending_groups {
                self.max_pending_groups = groups;
            }
            if let Some(interval) = transport.heartbeat_interval {
                self.heartbeat_interval =
                    Some(parse_duration("transport.heartbeat_interval", &interval)?);
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(node_id) = lookup("SDR_MESH_NODE_ID") {
            match node_id.parse::<u32>() {
                Ok(id) => {
                    self.node_id = id;
                    info!("Node ID overridden by environment: {}", id);
                }
                Err(_) => warn!("Ignoring invalid SDR_MESH_NODE_ID {:?}", node_id),
            }
        }

        if let Some(mtu) = lookup("SDR_MESH_MTU") {
            match mtu.parse::<usize>() {
                Ok(mtu) => {
                    self.mtu = mtu;
                    info!("MTU overridden by environment: {}", mtu);
                }
                Err(_) => warn!("Ignoring invalid SDR_MESH_MTU {:?}", mtu),
            }
        }

        if let Some(timeout) = lookup("SDR_MESH_REASSEMBLY_TIMEOUT_MS") {
            match timeout.parse::<u64>() {
                Ok(ms) => {
                    self.reassembly_timeout = Duration::from_millis(ms);
                    info!("Reassembly timeout overridden by environment: {}ms", ms);
                }
                Err(_) => warn!("Ignoring invalid SDR_MESH_REASSEMBLY_TIMEOUT_MS {:?}", timeout),
            }
        }
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| anyhow::anyhow!("invalid duration for {}: {:?} ({})", key, value, e))
}
