//! Observability and Metrics
//!
//! Atomic counters for the messaging layer. One [`Metrics`] instance is owned
//! by each messaging service and shared with its connections by reference.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for internode operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted or opened
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Total handshake attempts
    pub handshakes_total: AtomicU64,
    /// Handshakes that reached the message loop
    pub handshakes_success: AtomicU64,
    /// Handshakes that failed
    pub handshakes_failed: AtomicU64,
    /// Frames read off the wire
    pub frames_received: AtomicU64,
    /// Messages handed to dispatch
    pub messages_dispatched: AtomicU64,
    /// Responses dropped because the caller stopped waiting
    pub expired_drops: AtomicU64,
    /// Messages dropped because of version skew
    pub version_drops: AtomicU64,
    /// Connections ended by a framing error
    pub framing_errors: AtomicU64,
    /// Total messages sent
    pub messages_sent: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_total: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            messages_dispatched: AtomicU64::new(0),
            expired_drops: AtomicU64::new(0),
            version_drops: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a handshake attempt
    pub fn handshake_attempt(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful handshake
    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed handshake
    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame read off the wire
    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn message_dispatched(&self) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn expired_drop(&self) {
        self.expired_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn version_drop(&self) {
        self.version_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message sent
    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            expired_drops: self.expired_drops.load(Ordering::Relaxed),
            version_drops: self.version_drops.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            handshakes_total = snapshot.handshakes_total,
            handshakes_success = snapshot.handshakes_success,
            handshakes_failed = snapshot.handshakes_failed,
            frames_received = snapshot.frames_received,
            messages_dispatched = snapshot.messages_dispatched,
            expired_drops = snapshot.expired_drops,
            version_drops = snapshot.version_drops,
            framing_errors = snapshot.framing_errors,
            messages_sent = snapshot.messages_sent,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            uptime_seconds = snapshot.uptime_seconds,
            "Messaging metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_total: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub frames_received: u64,
    pub messages_dispatched: u64,
    pub expired_drops: u64,
    pub version_drops: u64,
    pub framing_errors: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
