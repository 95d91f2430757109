//! SDR link lifecycle.
//!
//! A [`LinkConnection`] owns one radio from discovery to close:
//!
//! ```text
//! Absent -> PermissionPending -> PermissionDenied
//!                             -> Open <-> Congested
//!                             -> Closed
//! ```
//!
//! All transitions happen on the transport worker. Permission answers and
//! channel I/O results are queued back to the worker as commands tagged with
//! the link id, so a late answer for a replaced link is simply ignored.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use mesh_wire::{LinkFrame, LinkFrameDecoder, LinkFrameKind};

use crate::congestion::{CongestionConfig, CongestionTracker};
use crate::error::LinkError;
use crate::hardware::{DeviceInfo, HardwareTransport, LinkStream, PermissionResponder, SdrModel};
use crate::service::Command;

/// Read buffer growth per channel read
const READ_CHUNK: usize = 4096;

/// Link states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No device discovered yet
    Absent,
    /// Waiting for the permission service
    PermissionPending,
    /// Access refused; terminal for this device
    PermissionDenied,
    /// Channel open
    Open,
    /// Channel open but the outbound side is backed up
    Congested,
    /// Channel closed; terminal
    Closed,
}

impl LinkState {
    /// Whether bursts are accepted
    pub fn can_send(self) -> bool {
        matches!(self, LinkState::Open | LinkState::Congested)
    }
}

/// Events raised by a link for the transport service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Channel opened
    Connected,
    /// Channel closed after being open
    Disconnected,
    /// Mesh bytes arrived
    DataLinkData(Bytes),
    /// Radio command output arrived
    CommandData(Bytes),
    /// Permission or channel failure
    ConnectionError(String),
    /// A burst was lost before reaching the radio
    PacketDropped,
    /// Human readable progress report
    StatusMessage(String),
    /// Entered (`true`) or left (`false`) the congested state
    Congestion(bool),
}

/// Result of channel I/O, reported back to the worker
#[derive(Debug)]
pub enum ChannelNotice {
    /// A frame was read
    Frame(LinkFrame),
    /// A queued write completed
    Flushed {
        /// Bytes written
        bytes: usize,
        /// Time from dequeue to flush
        elapsed: Duration,
    },
    /// Unrecoverable I/O error
    Failed(String),
    /// The device closed the channel
    Closed,
}

/// Reader and writer tasks of an open channel; aborted on drop
#[derive(Debug)]
struct ChannelGuard {
    writer_tx: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// One radio link
#[derive(Debug)]
pub struct LinkConnection {
    id: u64,
    state: LinkState,
    device: Option<DeviceInfo>,
    model: Option<SdrModel>,
    hardware: Arc<dyn HardwareTransport>,
    queue: mpsc::UnboundedSender<Command>,
    channel: Option<ChannelGuard>,
    max_payload: usize,
    tracker: CongestionTracker,
    events: VecDeque<LinkEvent>,
}

impl LinkConnection {
    pub(crate) fn new(
        id: u64,
        hardware: Arc<dyn HardwareTransport>,
        queue: mpsc::UnboundedSender<Command>,
        max_payload: usize,
        congestion: CongestionConfig,
    ) -> Self {
        Self {
            id,
            state: LinkState::Absent,
            device: None,
            model: None,
            hardware,
            queue,
            channel: None,
            max_payload,
            tracker: CongestionTracker::new(congestion),
            events: VecDeque::new(),
        }
    }

    /// Link id, unique per transport service
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Device this link was attached to
    pub fn device(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    /// Recognised radio family
    pub fn model(&self) -> Option<SdrModel> {
        self.model
    }

    /// Whether congestion was observed within the recent window
    pub fn is_recently_congested(&self) -> bool {
        self.tracker.is_recently_congested(Instant::now())
    }

    /// Take the events raised since the last call
    pub fn drain_events(&mut self) -> Vec<LinkEvent> {
        self.events.drain(..).collect()
    }

    /// A device appeared on the bus
    pub fn on_attach(&mut self, device: DeviceInfo) -> Result<(), LinkError> {
        if self.state != LinkState::Absent {
            debug!("Link {} ignoring attach of {} in state {:?}", self.id, device.id, self.state);
            return Ok(());
        }

        let model = SdrModel::probe(&device)
            .ok_or_else(|| LinkError::UnsupportedDevice(device.to_string()))?;

        info!("Link {}: {} found at {}, requesting permission", self.id, model, device.id);
        self.state = LinkState::PermissionPending;
        self.model = Some(model);
        self.device = Some(device.clone());
        self.events
            .push_back(LinkEvent::StatusMessage(format!("{} was found at {}", model, device.id)));

        let responder = PermissionResponder::new(self.id, device.clone(), self.queue.clone());
        self.hardware.request_permission(&device, responder);
        Ok(())
    }

    /// The permission service answered
    pub fn on_permission(&mut self, granted: bool) {
        if self.state != LinkState::PermissionPending {
            debug!(
                "Link {} ignoring permission answer in state {:?}",
                self.id, self.state
            );
            return;
        }
        let Some(device) = self.device.clone() else {
            return;
        };

        if !granted {
            warn!("Link {}: permission denied for {}", self.id, device.id);
            self.state = LinkState::PermissionDenied;
            self.events.push_back(LinkEvent::ConnectionError(
                LinkError::PermissionDenied(device.id).to_string(),
            ));
            return;
        }

        match self.hardware.open(&device) {
            Ok(stream) => {
                self.open_channel(stream);
                self.tracker.reset();
                self.state = LinkState::Open;
                info!("Link {} open on {}", self.id, device);
                self.events.push_back(LinkEvent::Connected);
            }
            Err(e) => {
                error!("Link {}: failed to open {}: {}", self.id, device.id, e);
                self.state = LinkState::Closed;
                self.events.push_back(LinkEvent::ConnectionError(e.to_string()));
            }
        }
    }

    /// Queue one fragment for transmission.
    ///
    /// Returns `false` without writing anything unless the link is open.
    pub fn burst(&mut self, data: Bytes) -> bool {
        if !self.state.can_send() {
            debug!(
                "Link {} dropping burst of {}b in state {:?}",
                self.id,
                data.len(),
                self.state
            );
            return false;
        }
        let Some(channel) = self.channel.as_ref() else {
            return false;
        };

        let len = data.len();
        let frame = match LinkFrame::data(data).encode() {
            Some(frame) if len <= self.max_payload => frame,
            _ => {
                warn!(
                    "Link {} dropping burst of {}b: exceeds link payload cap {}",
                    self.id, len, self.max_payload
                );
                self.events.push_back(LinkEvent::PacketDropped);
                return false;
            }
        };

        let framed = frame.len();
        if channel.writer_tx.send(frame).is_err() {
            // Writer already failed; its notice is queued
            debug!("Link {} writer gone, burst of {}b lost", self.id, len);
            self.events.push_back(LinkEvent::PacketDropped);
            return false;
        }

        self.tracker.record_enqueued(framed);
        self.update_congestion();
        true
    }

    /// Apply the result of channel I/O
    pub(crate) fn on_channel(&mut self, notice: ChannelNotice) {
        if !self.state.can_send() {
            debug!("Link {} ignoring channel notice in state {:?}", self.id, self.state);
            return;
        }

        match notice {
            ChannelNotice::Frame(frame) => {
                let event = match frame.kind {
                    LinkFrameKind::Data => LinkEvent::DataLinkData(frame.payload),
                    LinkFrameKind::Command => LinkEvent::CommandData(frame.payload),
                };
                self.events.push_back(event);
            }
            ChannelNotice::Flushed { bytes, elapsed } => {
                self.tracker.record_flushed(bytes, elapsed, Instant::now());
                self.update_congestion();
            }
            ChannelNotice::Failed(reason) => {
                error!("Link {} channel failed: {}", self.id, reason);
                let message = LinkError::Channel(reason).to_string();
                self.close("channel failed", Some(message));
            }
            ChannelNotice::Closed => {
                let message = LinkError::Channel("closed by device".to_string()).to_string();
                self.close("device closed the channel", Some(message));
            }
        }
    }

    /// The device left the bus
    pub fn on_detach(&mut self) {
        self.close("device detached", None);
    }

    /// Close the link; safe from any state and idempotent
    pub fn shutdown(&mut self) {
        self.close("shutdown requested", None);
    }

    /// Periodic re-evaluation of the congestion heuristic
    pub fn tick(&mut self) {
        if self.state.can_send() {
            self.update_congestion();
        }
    }

    fn close(&mut self, reason: &str, error: Option<String>) {
        if self.state == LinkState::Closed {
            return;
        }

        let was_connected = self.state.can_send();
        // Dropping the guard aborts the I/O tasks and releases the channel
        self.channel = None;
        self.state = LinkState::Closed;
        info!("Link {} closed: {}", self.id, reason);

        if let Some(message) = error {
            self.events.push_back(LinkEvent::ConnectionError(message));
        }
        if was_connected {
            self.events.push_back(LinkEvent::Disconnected);
        }
    }

    fn update_congestion(&mut self) {
        let congested = self.tracker.observe(Instant::now());
        match (self.state, congested) {
            (LinkState::Open, true) => {
                warn!(
                    "Link {} congested ({}b queued)",
                    self.id,
                    self.tracker.queued_bytes()
                );
                self.state = LinkState::Congested;
                self.events.push_back(LinkEvent::Congestion(true));
            }
            (LinkState::Congested, false) => {
                info!("Link {} recovered from congestion", self.id);
                self.state = LinkState::Open;
                self.events.push_back(LinkEvent::Congestion(false));
            }
            _ => {}
        }
    }

    fn open_channel(&mut self, stream: LinkStream) {
        let (reader_half, writer_half) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let decoder = LinkFrameDecoder::with_max_payload(self.max_payload);
        let reader = tokio::spawn(read_loop(self.id, reader_half, decoder, self.queue.clone()));
        let writer = tokio::spawn(write_loop(self.id, writer_half, writer_rx, self.queue.clone()));

        self.channel = Some(ChannelGuard {
            writer_tx,
            reader,
            writer,
        });
    }
}

fn notify(queue: &mpsc::UnboundedSender<Command>, link_id: u64, notice: ChannelNotice) -> bool {
    queue.send(Command::Channel { link_id, notice }).is_ok()
}

async fn read_loop(
    link_id: u64,
    mut reader: ReadHalf<LinkStream>,
    mut decoder: LinkFrameDecoder,
    queue: mpsc::UnboundedSender<Command>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        buf.reserve(READ_CHUNK);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("Link {} reader reached end of channel", link_id);
                notify(&queue, link_id, ChannelNotice::Closed);
                return;
            }
            Ok(n) => {
                debug!("Link {} read {}b", link_id, n);
                while let Some(frame) = decoder.decode(&mut buf) {
                    if !notify(&queue, link_id, ChannelNotice::Frame(frame)) {
                        return;
                    }
                }
            }
            Err(e) => {
                notify(&queue, link_id, ChannelNotice::Failed(format!("read failed: {}", e)));
                return;
            }
        }
    }
}

async fn write_loop(
    link_id: u64,
    mut writer: WriteHalf<LinkStream>,
    mut bursts: mpsc::UnboundedReceiver<Bytes>,
    queue: mpsc::UnboundedSender<Command>,
) {
    while let Some(bytes) = bursts.recv().await {
        let started = Instant::now();
        let result = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };

        let notice = match result {
            Ok(()) => ChannelNotice::Flushed {
                bytes: bytes.len(),
                elapsed: started.elapsed(),
            },
            Err(e) => {
                notify(&queue, link_id, ChannelNotice::Failed(format!("write failed: {}", e)));
                return;
            }
        };
        if !notify(&queue, link_id, notice) {
            return;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Link {} writer shutdown: {}", link_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{PermissionPolicy, SimulatedRadio};
    use mesh_wire::LINK_HEADER_SIZE;
    use tokio::io::DuplexStream;

    const TEST_MTU: usize = 1024;

    fn setup(policy: PermissionPolicy) -> (LinkConnection, Arc<SimulatedRadio>, mpsc::UnboundedReceiver<Command>) {
        let radio = Arc::new(SimulatedRadio::new(vec![SimulatedRadio::pluto_device()]));
        radio.set_policy(policy);
        let (tx, rx) = mpsc::unbounded_channel();
        let link = LinkConnection::new(1, radio.clone(), tx, TEST_MTU, CongestionConfig::default());
        (link, radio, rx)
    }

    async fn next_permission(rx: &mut mpsc::UnboundedReceiver<Command>) -> bool {
        loop {
            if let Command::Permission { granted, .. } = rx.recv().await.unwrap() {
                return granted;
            }
        }
    }

    async fn next_notice(rx: &mut mpsc::UnboundedReceiver<Command>) -> ChannelNotice {
        loop {
            if let Command::Channel { notice, .. } = rx.recv().await.unwrap() {
                return notice;
            }
        }
    }

    async fn open_link() -> (LinkConnection, Arc<SimulatedRadio>, mpsc::UnboundedReceiver<Command>, DuplexStream) {
        let (mut link, radio, mut rx) = setup(PermissionPolicy::Grant);
        link.on_attach(SimulatedRadio::pluto_device()).unwrap();
        let granted = next_permission(&mut rx).await;
        link.on_permission(granted);
        assert_eq!(link.state(), LinkState::Open);
        let peer = radio.take_peer().unwrap();
        (link, radio, rx, peer)
    }

    fn errors(events: &[LinkEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, LinkEvent::ConnectionError(_)))
            .count()
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let (mut link, radio, mut rx) = setup(PermissionPolicy::Deny);
        assert_eq!(link.state(), LinkState::Absent);

        link.on_attach(SimulatedRadio::pluto_device()).unwrap();
        assert_eq!(link.state(), LinkState::PermissionPending);
        assert_eq!(link.model(), Some(SdrModel::PlutoSdr));

        let granted = next_permission(&mut rx).await;
        link.on_permission(granted);
        assert_eq!(link.state(), LinkState::PermissionDenied);

        // A repeated answer changes nothing
        link.on_permission(false);
        let events = link.drain_events();
        assert_eq!(errors(&events), 1);
        assert!(!events.contains(&LinkEvent::Connected));
        assert_eq!(radio.open_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_device() {
        let (mut link, _radio, _rx) = setup(PermissionPolicy::Grant);
        let keyboard = DeviceInfo::new("usb9", "Keyboard", 0x046D, 0xC31C);
        assert!(matches!(
            link.on_attach(keyboard),
            Err(LinkError::UnsupportedDevice(_))
        ));
        assert_eq!(link.state(), LinkState::Absent);
        assert!(link.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_open_and_burst() {
        let (mut link, _radio, mut rx, mut peer) = open_link().await;
        assert_eq!(link.drain_events().last(), Some(&LinkEvent::Connected));

        assert!(link.burst(Bytes::from_static(b"fragment")));

        let mut buf = vec![0u8; LINK_HEADER_SIZE + 8];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[LINK_HEADER_SIZE..], b"fragment");

        match next_notice(&mut rx).await {
            ChannelNotice::Flushed { bytes, .. } => {
                assert_eq!(bytes, LINK_HEADER_SIZE + 8);
                link.on_channel(ChannelNotice::Flushed { bytes, elapsed: Duration::ZERO });
            }
            other => panic!("unexpected notice {:?}", other),
        }
        assert_eq!(link.tracker.queued_bytes(), 0);
    }

    #[tokio::test]
    async fn test_inbound_frames() {
        let (mut link, _radio, mut rx, mut peer) = open_link().await;
        link.drain_events();

        peer.write_all(&LinkFrame::data(Bytes::from_static(b"mesh")).encode().unwrap())
            .await
            .unwrap();
        peer.write_all(&LinkFrame::command(Bytes::from_static(b"ok")).encode().unwrap())
            .await
            .unwrap();

        for _ in 0..2 {
            let notice = next_notice(&mut rx).await;
            link.on_channel(notice);
        }
        assert_eq!(
            link.drain_events(),
            vec![
                LinkEvent::DataLinkData(Bytes::from_static(b"mesh")),
                LinkEvent::CommandData(Bytes::from_static(b"ok")),
            ]
        );
    }

    #[tokio::test]
    async fn test_corrupt_length_does_not_swallow_frames() {
        let (mut link, _radio, mut rx, mut peer) = open_link().await;
        link.drain_events();

        peer.write_all(&[mesh_wire::LINK_SYNC, 0x01, 0xFF, 0xFF]).await.unwrap();
        peer.write_all(&LinkFrame::data(Bytes::from_static(b"mesh")).encode().unwrap())
            .await
            .unwrap();

        let notice = next_notice(&mut rx).await;
        link.on_channel(notice);
        assert_eq!(
            link.drain_events(),
            vec![LinkEvent::DataLinkData(Bytes::from_static(b"mesh"))]
        );
    }

    #[tokio::test]
    async fn test_burst_over_mtu_dropped() {
        let (mut link, _radio, _rx, _peer) = open_link().await;
        link.drain_events();

        assert!(!link.burst(Bytes::from(vec![0u8; TEST_MTU + 1])));
        assert_eq!(link.drain_events(), vec![LinkEvent::PacketDropped]);
        assert_eq!(link.tracker.queued_bytes(), 0);
    }

    #[tokio::test]
    async fn test_burst_after_writer_failure_dropped() {
        let (mut link, _radio, mut rx, peer) = open_link().await;
        link.drain_events();
        drop(peer);

        // The write hits the hung-up channel and ends the writer task
        assert!(link.burst(Bytes::from_static(b"first")));
        loop {
            if let ChannelNotice::Failed(_) = next_notice(&mut rx).await {
                break;
            }
        }

        // Failure notice not yet applied, so the link still looks open
        assert_eq!(link.state(), LinkState::Open);
        assert!(!link.burst(Bytes::from_static(b"second")));
        assert_eq!(link.drain_events(), vec![LinkEvent::PacketDropped]);
    }

    #[tokio::test]
    async fn test_burst_when_closed_is_noop() {
        let (mut link, _radio, _rx, mut peer) = open_link().await;
        link.shutdown();
        assert_eq!(link.state(), LinkState::Closed);

        assert!(!link.burst(Bytes::from_static(b"late")));

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_burst_before_open_is_noop() {
        let (mut link, _radio, _rx) = setup(PermissionPolicy::Defer);
        assert!(!link.burst(Bytes::from_static(b"early")));
        link.on_attach(SimulatedRadio::pluto_device()).unwrap();
        assert!(!link.burst(Bytes::from_static(b"early")));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (mut link, _radio, _rx, _peer) = open_link().await;
        link.drain_events();

        link.shutdown();
        link.shutdown();
        link.on_detach();
        assert_eq!(link.drain_events(), vec![LinkEvent::Disconnected]);
    }

    #[tokio::test]
    async fn test_permission_after_close_ignored() {
        let (mut link, radio, _rx) = setup(PermissionPolicy::Defer);
        link.on_attach(SimulatedRadio::pluto_device()).unwrap();
        link.on_detach();
        assert_eq!(link.state(), LinkState::Closed);

        radio.take_deferred().into_iter().for_each(PermissionResponder::grant);
        link.on_permission(true);
        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(radio.open_count(), 0);
        // Never connected, so no disconnect either
        assert!(!link.drain_events().contains(&LinkEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_open_failure_closes() {
        let (mut link, radio, mut rx) = setup(PermissionPolicy::Grant);
        radio.fail_next_open("device busy");
        link.on_attach(SimulatedRadio::pluto_device()).unwrap();
        let granted = next_permission(&mut rx).await;
        link.on_permission(granted);

        assert_eq!(link.state(), LinkState::Closed);
        let events = link.drain_events();
        assert_eq!(errors(&events), 1);
        assert!(!events.contains(&LinkEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_device_hangup_closes() {
        let (mut link, radio, mut rx, peer) = open_link().await;
        link.drain_events();
        drop(peer);

        let notice = next_notice(&mut rx).await;
        assert!(matches!(notice, ChannelNotice::Closed));
        link.on_channel(notice);

        assert_eq!(link.state(), LinkState::Closed);
        let events = link.drain_events();
        assert_eq!(errors(&events), 1);
        assert_eq!(events.last(), Some(&LinkEvent::Disconnected));
        // No automatic reconnect
        assert_eq!(radio.open_count(), 1);
    }

    #[tokio::test]
    async fn test_congestion_transitions() {
        let radio = Arc::new(SimulatedRadio::new(vec![]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let congestion = CongestionConfig {
            max_queue_bytes: 100,
            ..CongestionConfig::default()
        };
        let mut link = LinkConnection::new(7, radio.clone(), tx, TEST_MTU, congestion);
        link.on_attach(SimulatedRadio::pluto_device()).unwrap();
        let granted = next_permission(&mut rx).await;
        link.on_permission(granted);
        link.drain_events();
        let _peer = radio.take_peer().unwrap();

        for _ in 0..3 {
            assert!(link.burst(Bytes::from(vec![0u8; 60])));
        }
        assert_eq!(link.state(), LinkState::Congested);
        assert!(link.is_recently_congested());

        // Congested links still accept bursts
        assert!(link.burst(Bytes::from(vec![0u8; 60])));

        for _ in 0..4 {
            let notice = next_notice(&mut rx).await;
            link.on_channel(notice);
        }
        assert_eq!(link.state(), LinkState::Open);
        assert!(link.is_recently_congested());
        assert_eq!(
            link.drain_events(),
            vec![LinkEvent::Congestion(true), LinkEvent::Congestion(false)]
        );
    }
}
