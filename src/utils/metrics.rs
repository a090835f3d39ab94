//! Session core counters.
//!
//! One [`Metrics`] instance is owned by the connection registry and shared by
//! every tier and session attached to it. All counters are relaxed atomics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted
    pub connections_total: AtomicU64,
    /// Currently connected sessions
    pub connections_active: AtomicU64,
    /// Frames extracted from receive buffers
    pub frames_received: AtomicU64,
    /// Frames written to sockets
    pub frames_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    /// Frames dropped by a throttle rule
    pub frames_throttled: AtomicU64,
    /// Frames dropped by a squelch rule
    pub frames_squelched: AtomicU64,
    /// Sessions closed for exceeding a throttle disconnect threshold
    pub abuse_disconnects: AtomicU64,
    /// Sessions closed by the heartbeat reaper
    pub heartbeat_reaps: AtomicU64,
    /// Connections closed for bad framing or buffer overflow
    pub framing_faults: AtomicU64,
    /// Handler errors, panics and frames that failed to decrypt
    pub handler_faults: AtomicU64,
    pub redirects_issued: AtomicU64,
    pub redirects_consumed: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            frames_throttled: AtomicU64::new(0),
            frames_squelched: AtomicU64::new(0),
            abuse_disconnects: AtomicU64::new(0),
            heartbeat_reaps: AtomicU64::new(0),
            framing_faults: AtomicU64::new(0),
            handler_faults: AtomicU64::new(0),
            redirects_issued: AtomicU64::new(0),
            redirects_consumed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: a session closed twice must not wrap the gauge.
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn bytes_read(&self, count: u64) {
        self.bytes_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn frame_throttled(&self) {
        self.frames_throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_squelched(&self) {
        self.frames_squelched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn abuse_disconnect(&self) {
        self.abuse_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_reap(&self) {
        self.heartbeat_reaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn framing_fault(&self) {
        self.framing_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_fault(&self) {
        self.handler_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn redirect_issued(&self) {
        self.redirects_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn redirect_consumed(&self) {
        self.redirects_consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_throttled: self.frames_throttled.load(Ordering::Relaxed),
            frames_squelched: self.frames_squelched.load(Ordering::Relaxed),
            abuse_disconnects: self.abuse_disconnects.load(Ordering::Relaxed),
            heartbeat_reaps: self.heartbeat_reaps.load(Ordering::Relaxed),
            framing_faults: self.framing_faults.load(Ordering::Relaxed),
            handler_faults: self.handler_faults.load(Ordering::Relaxed),
            redirects_issued: self.redirects_issued.load(Ordering::Relaxed),
            redirects_consumed: self.redirects_consumed.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            frames_received = snapshot.frames_received,
            frames_sent = snapshot.frames_sent,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            frames_throttled = snapshot.frames_throttled,
            frames_squelched = snapshot.frames_squelched,
            abuse_disconnects = snapshot.abuse_disconnects,
            heartbeat_reaps = snapshot.heartbeat_reaps,
            framing_faults = snapshot.framing_faults,
            handler_faults = snapshot.handler_faults,
            redirects_issued = snapshot.redirects_issued,
            redirects_consumed = snapshot.redirects_consumed,
            uptime_seconds = snapshot.uptime_seconds,
            "Session core metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub frames_throttled: u64,
    pub frames_squelched: u64,
    pub abuse_disconnects: u64,
    pub heartbeat_reaps: u64,
    pub framing_faults: u64,
    pub handler_faults: u64,
    pub redirects_issued: u64,
    pub redirects_consumed: u64,
    pub uptime_seconds: u64,
}
