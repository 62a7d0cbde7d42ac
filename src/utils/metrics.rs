//! Observability and Metrics
//!
//! Counters for the backup server, updated with relaxed atomics from every
//! connection task and read as a [`MetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Server-wide counters. Shared as `Arc<ServerMetrics>`.
#[derive(Debug)]
pub struct ServerMetrics {
    /// Total connections accepted
    pub connections_total: AtomicU64,
    /// Currently open connections
    pub connections_active: AtomicU64,
    /// Requests that reached the state machine
    pub requests_total: AtomicU64,
    /// Frames answered with GENERAL_ERROR before dispatch
    pub codec_errors: AtomicU64,
    /// Requests answered with GENERAL_ERROR by the state machine
    pub protocol_errors: AtomicU64,
    /// Successful sign-ups
    pub registrations: AtomicU64,
    /// Session keys issued, on key exchange or sign-in
    pub keys_issued: AtomicU64,
    /// Files decrypted and stored
    pub files_received: AtomicU64,
    /// Files confirmed by the client
    pub files_validated: AtomicU64,
    /// Decrypted bytes stored
    pub bytes_received: AtomicU64,
    start_time: Instant,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            requests_total: AtomicU64::new(0),
            codec_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            registrations: AtomicU64::new(0),
            keys_issued: AtomicU64::new(0),
            files_received: AtomicU64::new(0),
            files_validated: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn codec_error(&self) {
        self.codec_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn registration(&self) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn key_issued(&self) {
        self.keys_issued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stored file of `byte_count` plaintext bytes
    pub fn file_received(&self, byte_count: u64) {
        self.files_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn file_validated(&self) {
        self.files_validated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            codec_errors: self.codec_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            keys_issued: self.keys_issued.load(Ordering::Relaxed),
            files_received: self.files_received.load(Ordering::Relaxed),
            files_validated: self.files_validated.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            connections_total = s.connections_total,
            connections_active = s.connections_active,
            requests_total = s.requests_total,
            codec_errors = s.codec_errors,
            protocol_errors = s.protocol_errors,
            registrations = s.registrations,
            keys_issued = s.keys_issued,
            files_received = s.files_received,
            files_validated = s.files_validated,
            bytes_received = s.bytes_received,
            uptime_seconds = s.uptime_seconds,
            "Server metrics snapshot"
        );
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub requests_total: u64,
    pub codec_errors: u64,
    pub protocol_errors: u64,
    pub registrations: u64,
    pub keys_issued: u64,
    pub files_received: u64,
    pub files_validated: u64,
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
        debug!(
            operation = self.operation,
            duration_us = self.start.elapsed().as_micros() as u64,
            "Operation completed"
        );
    }
}
