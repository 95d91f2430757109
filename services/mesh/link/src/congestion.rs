//! Congestion tracker for the outbound radio channel

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Congestion thresholds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CongestionConfig {
    /// Queued-but-unflushed bytes above which the link is congested
    pub max_queue_bytes: usize,
    /// Average flush latency above which the link is congested
    pub max_latency: Duration,
    /// Number of latency samples averaged
    pub sample_window: usize,
    /// How long a congestion episode stays "recent"
    pub recent_window: Duration,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            max_queue_bytes: 16 * 1024,
            max_latency: Duration::from_millis(500),
            sample_window: 16,
            recent_window: Duration::from_secs(5),
        }
    }
}

/// Tracks queue depth and flush latency of the outbound channel
#[derive(Debug)]
pub struct CongestionTracker {
    config: CongestionConfig,
    /// Bytes handed to the writer and not yet flushed
    queued_bytes: usize,
    /// Recent flush latencies with the time they were observed
    latencies: VecDeque<(Instant, Duration)>,
    /// Last time the heuristic reported congestion
    last_congested: Option<Instant>,
}

impl CongestionTracker {
    /// Create a tracker
    pub fn new(config: CongestionConfig) -> Self {
        Self {
            latencies: VecDeque::with_capacity(config.sample_window),
            config,
            queued_bytes: 0,
            last_congested: None,
        }
    }

    /// Record bytes handed to the writer
    pub fn record_enqueued(&mut self, bytes: usize) {
        self.queued_bytes = self.queued_bytes.saturating_add(bytes);
    }

    /// Record a completed write
    pub fn record_flushed(&mut self, bytes: usize, latency: Duration, now: Instant) {
        self.queued_bytes = self.queued_bytes.saturating_sub(bytes);
        self.latencies.push_back((now, latency));
        while self.latencies.len() > self.config.sample_window.max(1) {
            self.latencies.pop_front();
        }
    }

    /// Bytes waiting to be flushed
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Average of the latency samples observed within the recent window
    pub fn average_latency(&self, now: Instant) -> Option<Duration> {
        let recent: Vec<Duration> = self
            .latencies
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) < self.config.recent_window)
            .map(|(_, latency)| *latency)
            .collect();

        if recent.is_empty() {
            return None;
        }
        Some(recent.iter().sum::<Duration>() / recent.len() as u32)
    }

    /// Evaluate the heuristic, remembering when congestion was last seen
    pub fn observe(&mut self, now: Instant) -> bool {
        let over_queue = self.queued_bytes > self.config.max_queue_bytes;
        let over_latency = self
            .average_latency(now)
            .map_or(false, |avg| avg > self.config.max_latency);

        let congested = over_queue || over_latency;
        if congested {
            debug!(
                "Congestion observed: {}b queued, average latency {:?}",
                self.queued_bytes,
                self.average_latency(now)
            );
            self.last_congested = Some(now);
        }
        congested
    }

    /// Whether congestion was observed within the recent window
    pub fn is_recently_congested(&self, now: Instant) -> bool {
        self.last_congested
            .map_or(false, |at| now.saturating_duration_since(at) < self.config.recent_window)
    }

    /// Forget all samples, e.g. when a new channel opens
    pub fn reset(&mut self) {
        self.queued_bytes = 0;
        self.latencies.clear();
        self.last_congested = None;
    }
}
