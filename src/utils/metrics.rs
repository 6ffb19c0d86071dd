//! Observability and Metrics
//!
//! Counters for sessions, frames and migrations. One [`Metrics`] is shared as
//! `Arc<Metrics>` by every session of a role server.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector for one role server
#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted
    pub connections_total: AtomicU64,
    /// Currently open sessions
    pub connections_active: AtomicU64,
    /// Client frames decoded
    pub frames_received: AtomicU64,
    /// Client frames encoded
    pub frames_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Bad headers, truncated bodies and other wire faults
    pub protocol_errors: AtomicU64,
    /// Messages whose kind was illegal in the session state
    pub state_violations: AtomicU64,
    /// Uncorroborated migration-in attempts
    pub identity_mismatches: AtomicU64,
    /// Authority claims the hub refused
    pub authority_denials: AtomicU64,
    /// Sessions closed by a deadline
    pub timeouts: AtomicU64,
    /// Outbound migrations requested
    pub migrations_requested: AtomicU64,
    /// Outbound migrations that redirected the client
    pub migrations_succeeded: AtomicU64,
    /// Outbound migrations declined by a directory miss
    pub migrations_missed: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            state_violations: AtomicU64::new(0),
            identity_mismatches: AtomicU64::new(0),
            authority_denials: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            migrations_requested: AtomicU64::new(0),
            migrations_succeeded: AtomicU64::new(0),
            migrations_missed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session closed
    pub fn connection_closed(&self) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state_violation(&self) {
        self.state_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn identity_mismatch(&self) {
        self.identity_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn authority_denied(&self) {
        self.authority_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn migration_requested(&self) {
        self.migrations_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn migration_succeeded(&self) {
        self.migrations_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn migration_missed(&self) {
        self.migrations_missed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            state_violations: self.state_violations.load(Ordering::Relaxed),
            identity_mismatches: self.identity_mismatches.load(Ordering::Relaxed),
            authority_denials: self.authority_denials.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            migrations_requested: self.migrations_requested.load(Ordering::Relaxed),
            migrations_succeeded: self.migrations_succeeded.load(Ordering::Relaxed),
            migrations_missed: self.migrations_missed.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            frames_received = snapshot.frames_received,
            frames_sent = snapshot.frames_sent,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            protocol_errors = snapshot.protocol_errors,
            state_violations = snapshot.state_violations,
            identity_mismatches = snapshot.identity_mismatches,
            authority_denials = snapshot.authority_denials,
            timeouts = snapshot.timeouts,
            migrations_requested = snapshot.migrations_requested,
            migrations_succeeded = snapshot.migrations_succeeded,
            migrations_missed = snapshot.migrations_missed,
            uptime_seconds = snapshot.uptime_seconds,
            "Session metrics snapshot"
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
    pub protocol_errors: u64,
    pub state_violations: u64,
    pub identity_mismatches: u64,
    pub authority_denials: u64,
    pub timeouts: u64,
    pub migrations_requested: u64,
    pub migrations_succeeded: u64,
    pub migrations_missed: u64,
    pub uptime_seconds: u64,
}
