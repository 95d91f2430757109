//! Transport service worker.
//!
//! One [`TransportService`] owns the active link, the segmenter, and the
//! reassembler. Every mutation of that state happens on the worker task;
//! callers talk to it through a cloneable [`TransportHandle`] that only
//! enqueues commands. Listener callbacks are made from the worker in the
//! order events occurred.

use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use mesh_wire::{
    Fragment, Packet, PacketType, Reassembler, Segmenter, MAX_LINK_PAYLOAD, MIN_MTU,
};

use crate::congestion::CongestionConfig;
use crate::connection::{ChannelNotice, LinkConnection, LinkEvent, LinkState};
use crate::error::LinkError;
use crate::hardware::{DeviceInfo, HardwareTransport, SdrModel};
use crate::keepalive::{build_heartbeat, HeartbeatSchedule};
use crate::listener::MeshStatusListener;
use crate::location::{is_better_fix, PositionFix};

/// Configuration for the transport service
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// This node's id, stamped as origin on every fragment
    pub node_id: u32,
    /// Largest encoded fragment handed to the link
    pub mtu: usize,
    /// Period of reassembly sweeps and congestion re-evaluation
    pub housekeeping_interval: Duration,
    /// Age after which an incomplete group is dropped
    pub reassembly_timeout: Duration,
    /// Incomplete groups held at once before the oldest is evicted
    pub max_pending_groups: usize,
    /// Heartbeat period; `None` disables heartbeats
    pub heartbeat_interval: Option<Duration>,
    /// Congestion thresholds
    pub congestion: CongestionConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            mtu: 1024,
            housekeeping_interval: Duration::from_secs(1),
            reassembly_timeout: Duration::from_secs(5),
            max_pending_groups: 64,
            heartbeat_interval: None,
            congestion: CongestionConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.mtu < MIN_MTU || self.mtu > MAX_LINK_PAYLOAD {
            return Err(LinkError::InvalidConfig(format!(
                "mtu {} outside {}..={}",
                self.mtu, MIN_MTU, MAX_LINK_PAYLOAD
            )));
        }
        if self.housekeeping_interval.is_zero() {
            return Err(LinkError::InvalidConfig(
                "housekeeping interval must be non-zero".to_string(),
            ));
        }
        if self.reassembly_timeout.is_zero() {
            return Err(LinkError::InvalidConfig(
                "reassembly timeout must be non-zero".to_string(),
            ));
        }
        if self.max_pending_groups == 0 {
            return Err(LinkError::InvalidConfig(
                "max pending groups must be non-zero".to_string(),
            ));
        }
        if matches!(self.heartbeat_interval, Some(interval) if interval.is_zero()) {
            return Err(LinkError::InvalidConfig(
                "heartbeat interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counters kept by the worker
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    /// Payloads whose every fragment was handed to the link; heartbeats are
    /// counted separately
    pub packets_sent: u64,
    /// Fragments handed to the link
    pub fragments_sent: u64,
    /// Bursts refused (link not ready, payload too large)
    pub bursts_rejected: u64,
    /// Heartbeats sent
    pub heartbeats_sent: u64,
    /// Fragments accepted from the link
    pub fragments_received: u64,
    /// Packets delivered upstream
    pub packets_received: u64,
    /// Packets lost (timeouts, evictions, link drops)
    pub packets_dropped: u64,
    /// Malformed fragments or packets discarded
    pub malformed: u64,
}

/// Snapshot published after every unit of work
#[derive(Clone, Debug, Default, Serialize)]
pub struct TransportStatus {
    /// State of the active link, if any
    pub link_state: Option<LinkState>,
    /// Whether the link was congested within the recent window
    pub recently_congested: bool,
    /// Incomplete reassembly groups
    pub pending_groups: usize,
    /// Best known position
    pub best_fix: Option<PositionFix>,
    /// Counters
    pub stats: TransportStats,
}

/// Work items for the transport worker
#[derive(Debug)]
pub(crate) enum Command {
    /// Segment and transmit a payload
    Burst(Bytes),
    /// Deliver an already reassembled packet upstream
    DeliverPacket(Bytes),
    /// Inbound fragment bytes injected from outside the link
    DataLinkData(Bytes),
    /// A device appeared
    Attached(DeviceInfo),
    /// A device disappeared
    Detached(DeviceInfo),
    /// Permission answer for a link
    Permission { link_id: u64, granted: bool },
    /// Channel I/O result for a link
    Channel { link_id: u64, notice: ChannelNotice },
    /// Replace the status listener
    SetListener(Option<Arc<dyn MeshStatusListener>>),
    /// New position report
    UpdateLocation(PositionFix),
}

/// Cloneable handle to a running transport service
#[derive(Clone, Debug)]
pub struct TransportHandle {
    queue: mpsc::UnboundedSender<Command>,
    shutdown_tx: mpsc::Sender<()>,
    status: watch::Receiver<TransportStatus>,
}

impl TransportHandle {
    fn enqueue(&self, command: Command) -> Result<(), LinkError> {
        self.queue.send(command).map_err(|_| LinkError::ServiceStopped)
    }

    /// Segment `data` and transmit it over the SDR.
    ///
    /// Ignored by the worker (and counted as rejected) unless the link is
    /// open.
    pub fn burst(&self, data: impl Into<Bytes>) -> Result<(), LinkError> {
        self.enqueue(Command::Burst(data.into()))
    }

    /// Encode and transmit a typed packet
    pub fn send_packet(&self, packet: &Packet) -> Result<(), LinkError> {
        self.burst(packet.encode())
    }

    /// Deliver an already reassembled packet to the listener
    pub fn on_packet_received(&self, packet: impl Into<Bytes>) -> Result<(), LinkError> {
        self.enqueue(Command::DeliverPacket(packet.into()))
    }

    /// Feed inbound fragment bytes to the reassembler
    pub fn receive_data_link_data(&self, data: impl Into<Bytes>) -> Result<(), LinkError> {
        self.enqueue(Command::DataLinkData(data.into()))
    }

    /// Report a device attached to the bus
    pub fn hardware_attached(&self, device: DeviceInfo) -> Result<(), LinkError> {
        self.enqueue(Command::Attached(device))
    }

    /// Report a device detached from the bus
    pub fn hardware_detached(&self, device: DeviceInfo) -> Result<(), LinkError> {
        self.enqueue(Command::Detached(device))
    }

    /// Replace (or clear) the status listener
    pub fn set_listener(&self, listener: Option<Arc<dyn MeshStatusListener>>) -> Result<(), LinkError> {
        self.enqueue(Command::SetListener(listener))
    }

    /// Offer a new position fix
    pub fn update_location(&self, fix: PositionFix) -> Result<(), LinkError> {
        self.enqueue(Command::UpdateLocation(fix))
    }

    /// Ask the worker to stop; safe to call repeatedly
    pub fn shutdown(&self) {
        if self.shutdown_tx.try_send(()).is_err() {
            debug!("Transport shutdown already requested");
        }
    }

    /// Latest published status
    pub fn status(&self) -> TransportStatus {
        self.status.borrow().clone()
    }

    /// State of the active link, if any
    pub fn link_state(&self) -> Option<LinkState> {
        self.status.borrow().link_state
    }

    /// Whether the link was congested within the recent window
    pub fn is_recently_congested(&self) -> bool {
        self.status.borrow().recently_congested
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<TransportStatus> {
        self.status.clone()
    }
}

/// The transport worker
#[derive(Debug)]
pub struct TransportService {
    config: TransportConfig,
    hardware: Arc<dyn HardwareTransport>,
    listener: Option<Arc<dyn MeshStatusListener>>,
    link: Option<LinkConnection>,
    next_link_id: u64,
    segmenter: Segmenter,
    reassembler: Reassembler,
    heartbeat: HeartbeatSchedule,
    best_fix: Option<PositionFix>,
    ready: Option<bool>,
    stats: TransportStats,
    queue: mpsc::UnboundedSender<Command>,
    command_rx: Option<mpsc::UnboundedReceiver<Command>>,
    shutdown_rx: Option<mpsc::Receiver<()>>,
    status_tx: watch::Sender<TransportStatus>,
}

impl TransportService {
    /// Create a service and its handle.
    ///
    /// The worker also stops once every handle has been dropped.
    pub fn new(
        config: TransportConfig,
        hardware: Arc<dyn HardwareTransport>,
    ) -> Result<(Self, TransportHandle), LinkError> {
        config.validate()?;

        let (queue, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(TransportStatus::default());

        let service = Self {
            segmenter: Segmenter::new(config.node_id),
            reassembler: Reassembler::new(config.max_pending_groups),
            heartbeat: HeartbeatSchedule::new(config.heartbeat_interval),
            config,
            hardware,
            listener: None,
            link: None,
            next_link_id: 0,
            best_fix: None,
            ready: None,
            stats: TransportStats::default(),
            queue: queue.clone(),
            command_rx: Some(command_rx),
            shutdown_rx: Some(shutdown_rx),
            status_tx,
        };
        let handle = TransportHandle {
            queue,
            shutdown_tx,
            status: status_rx,
        };
        Ok((service, handle))
    }

    /// Set the status listener before the worker starts
    pub fn set_listener<T>(&mut self, listener: Arc<T>)
    where
        T: MeshStatusListener + 'static,
    {
        self.listener = Some(listener);
    }

    /// Run the worker on a new task
    pub fn spawn(self) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(self.run())
    }

    /// Run the worker until shutdown
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut command_rx = self
            .command_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("Transport service already started"))?;
        let mut shutdown_rx = self
            .shutdown_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("Transport service already started"))?;

        info!(
            "Starting transport service for node {} (mtu {})",
            self.config.node_id, self.config.mtu
        );

        let mut housekeeping = tokio::time::interval(self.config.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        housekeeping.tick().await;

        self.scan_devices();
        self.flush_link_events();
        self.publish_status();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Transport service shutting down");
                    break;
                }

                Some(command) = command_rx.recv() => {
                    self.handle_command(command);
                }

                _ = housekeeping.tick() => {
                    self.housekeeping();
                }
            }
            self.publish_status();
        }

        command_rx.close();
        let mut discarded = 0usize;
        while command_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!("Discarded {} pending work item(s) at shutdown", discarded);
        }

        if let Some(mut link) = self.link.take() {
            link.shutdown();
            for event in link.drain_events() {
                self.handle_link_event(event);
            }
        }
        self.publish_status();

        info!("Transport service stopped");
        Ok(())
    }

    fn scan_devices(&mut self) {
        let devices = self.hardware.enumerate();
        if devices.is_empty() {
            self.notify_status("No USB devices detected");
            return;
        }

        self.notify_status(&format!("{} USB device(s) detected", devices.len()));
        match devices.into_iter().find(|d| SdrModel::probe(d).is_some()) {
            Some(device) => self.attach(device),
            None => self.notify_status("No supported SDR found"),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Burst(data) => self.burst(data),
            Command::DeliverPacket(packet) => self.deliver(packet),
            Command::DataLinkData(data) => self.ingest(data),
            Command::Attached(device) => self.attach(device),
            Command::Detached(device) => self.detach(&device),
            Command::Permission { link_id, granted } => match self.current_link(link_id) {
                Some(link) => link.on_permission(granted),
                None => debug!("Ignoring permission answer for stale link {}", link_id),
            },
            Command::Channel { link_id, notice } => match self.current_link(link_id) {
                Some(link) => link.on_channel(notice),
                None => debug!("Ignoring channel notice for stale link {}", link_id),
            },
            Command::SetListener(listener) => {
                debug!("Status listener {}", if listener.is_some() { "set" } else { "cleared" });
                self.listener = listener;
            }
            Command::UpdateLocation(fix) => self.update_location(fix),
        }
        self.flush_link_events();
    }

    fn current_link(&mut self, link_id: u64) -> Option<&mut LinkConnection> {
        self.link.as_mut().filter(|link| link.id() == link_id)
    }

    fn attach(&mut self, device: DeviceInfo) {
        if SdrModel::probe(&device).is_none() {
            info!("Ignoring unsupported device {}", device);
            self.notify_status(&format!("{} is not a supported SDR", device));
            return;
        }

        if let Some(mut previous) = self.link.take() {
            info!("Replacing link {} with device {}", previous.id(), device.id);
            previous.shutdown();
            for event in previous.drain_events() {
                self.handle_link_event(event);
            }
        }

        self.next_link_id += 1;
        let mut link = LinkConnection::new(
            self.next_link_id,
            self.hardware.clone(),
            self.queue.clone(),
            self.config.mtu,
            self.config.congestion.clone(),
        );
        if let Err(e) = link.on_attach(device) {
            warn!("Failed to attach device: {}", e);
        }
        self.link = Some(link);
    }

    fn detach(&mut self, device: &DeviceInfo) {
        match self.link.as_mut() {
            Some(link) if link.device().map_or(false, |d| d.id == device.id) => {
                link.on_detach();
            }
            _ => debug!("Ignoring detach of unrelated device {}", device.id),
        }
    }

    fn burst(&mut self, data: Bytes) {
        if self.transmit(data) {
            self.stats.packets_sent += 1;
        }
    }

    /// Segment and enqueue one payload; `true` once every fragment is queued
    fn transmit(&mut self, data: Bytes) -> bool {
        let ready = self
            .link
            .as_ref()
            .map_or(false, |link| link.state().can_send());
        if !ready {
            debug!("Ignoring burst of {}b, SDR not ready", data.len());
            self.stats.bursts_rejected += 1;
            return false;
        }

        let len = data.len();
        let segments = match self.segmenter.segment(data, self.config.mtu) {
            Ok(segments) => segments,
            Err(e) => {
                warn!("Rejecting burst of {}b: {}", len, e);
                self.stats.bursts_rejected += 1;
                return false;
            }
        };

        let Some(link) = self.link.as_mut() else {
            return false;
        };
        debug!(
            "Sending {}b as group {} in {} fragment(s)",
            len,
            segments.group_id(),
            segments.fragment_count()
        );
        for fragment in segments {
            // A refused fragment raises its own dropped-packet event
            if !link.burst(fragment.encode()) {
                warn!("Link stopped accepting fragments of group {}", fragment.group_id);
                return false;
            }
            self.stats.fragments_sent += 1;
        }
        true
    }

    fn ingest(&mut self, data: Bytes) {
        let fragment = match Fragment::decode(data) {
            Ok(fragment) => fragment,
            Err(e) => {
                warn!("Discarding malformed fragment: {}", e);
                self.stats.malformed += 1;
                return;
            }
        };
        self.stats.fragments_received += 1;

        let completed = self
            .reassembler
            .on_fragment(fragment, Instant::now().into_std());
        self.report_evictions();
        let Some(payload) = completed else {
            return;
        };

        match Packet::decode(&payload) {
            Ok(packet) => {
                let packet_type = packet.packet_type();
                debug!(
                    "Received {:?} from node {} ({}b)",
                    packet_type,
                    packet.header.origin_id,
                    payload.len()
                );
                if packet_type == PacketType::Disconnecting {
                    info!("Node {} is leaving the mesh", packet.header.origin_id);
                }
                self.deliver(payload);
            }
            Err(e) => {
                warn!("Discarding malformed packet of {}b: {}", payload.len(), e);
                self.stats.malformed += 1;
            }
        }
    }

    fn deliver(&mut self, packet: Bytes) {
        self.stats.packets_received += 1;
        match &self.listener {
            Some(listener) => listener.on_packet_received(packet),
            None => debug!("No listener for packet of {}b", packet.len()),
        }
    }

    fn report_evictions(&mut self) {
        for _ in 0..self.reassembler.take_evicted() {
            self.packet_dropped();
        }
    }

    fn packet_dropped(&mut self) {
        self.stats.packets_dropped += 1;
        if let Some(listener) = &self.listener {
            listener.on_packet_dropped();
        }
    }

    fn housekeeping(&mut self) {
        let now = Instant::now();

        let report = self
            .reassembler
            .sweep_expired(now.into_std(), self.config.reassembly_timeout);
        for key in &report.expired {
            debug!(
                "Reassembly of group {} from node {} timed out",
                key.group_id, key.origin_id
            );
            self.packet_dropped();
        }

        if let Some(link) = self.link.as_mut() {
            link.tick();
        }

        let can_send = self
            .link
            .as_ref()
            .map_or(false, |link| link.state().can_send());
        if can_send && self.heartbeat.is_due(now) {
            self.heartbeat.mark_sent(now);
            if self.transmit(build_heartbeat(self.config.node_id)) {
                self.stats.heartbeats_sent += 1;
            }
        }

        self.flush_link_events();
    }

    fn update_location(&mut self, fix: PositionFix) {
        if is_better_fix(&fix, self.best_fix.as_ref()) {
            debug!(
                "New best fix from {} ({:.1}m)",
                fix.provider, fix.accuracy_m
            );
            self.best_fix = Some(fix);
        }
    }

    fn flush_link_events(&mut self) {
        let events = match self.link.as_mut() {
            Some(link) => link.drain_events(),
            None => return,
        };
        for event in events {
            self.handle_link_event(event);
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                self.notify(|l| l.on_connect());
                self.notify_status("SDR is ready");
                self.set_ready(true);
            }
            LinkEvent::Disconnected => {
                self.notify(|l| l.on_disconnect());
                self.set_ready(false);
            }
            LinkEvent::DataLinkData(data) => self.ingest(data),
            LinkEvent::CommandData(data) => self.notify(|l| l.on_command_data(&data)),
            LinkEvent::ConnectionError(message) => {
                error!("SDR connection error: {}", message);
                self.notify(|l| l.on_connection_error(&message));
                let connected = self
                    .link
                    .as_ref()
                    .map_or(false, |link| link.state().can_send());
                if !connected {
                    self.set_ready(false);
                }
            }
            LinkEvent::PacketDropped => self.packet_dropped(),
            LinkEvent::StatusMessage(message) => self.notify_status(&message),
            LinkEvent::Congestion(congested) => self.notify(|l| l.on_congestion(congested)),
        }
    }

    /// Report readiness only when it changes
    fn set_ready(&mut self, ready: bool) {
        if self.ready != Some(ready) {
            self.ready = Some(ready);
            self.notify(|l| l.on_ready(ready));
        }
    }

    fn notify(&self, callback: impl FnOnce(&dyn MeshStatusListener)) {
        if let Some(listener) = &self.listener {
            callback(listener.as_ref());
        }
    }

    fn notify_status(&self, message: &str) {
        info!("{}", message);
        self.notify(|l| l.on_status_message(message));
    }

    fn publish_status(&self) {
        let status = TransportStatus {
            link_state: self.link.as_ref().map(|link| link.state()),
            recently_congested: self
                .link
                .as_ref()
                .map_or(false, |link| link.is_recently_congested()),
            pending_groups: self.reassembler.pending_groups(),
            best_fix: self.best_fix.clone(),
            stats: self.stats.clone(),
        };
        self.status_tx.send_replace(status);
    }
}
