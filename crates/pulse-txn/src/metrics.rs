//! Heartbeater metrics
//!
//! Plain atomic counters. Exporting them is up to the embedding node.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every heartbeater on a node
#[derive(Debug, Default)]
pub struct TxnMetrics {
    heartbeat_loops_started: AtomicU64,
    heartbeats_sent: AtomicU64,
    heartbeat_failures: AtomicU64,
    aborts_detected: AtomicU64,
    async_aborts_sent: AtomicU64,
}

/// Point-in-time copy of [`TxnMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnMetricsSnapshot {
    pub heartbeat_loops_started: u64,
    pub heartbeats_sent: u64,
    pub heartbeat_failures: u64,
    pub aborts_detected: u64,
    pub async_aborts_sent: u64,
}

impl TxnMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_loop_started(&self) {
        self.heartbeat_loops_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_failure(&self) {
        self.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abort_detected(&self) {
        self.aborts_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_async_abort(&self) {
        self.async_aborts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TxnMetricsSnapshot {
        TxnMetricsSnapshot {
            heartbeat_loops_started: self.heartbeat_loops_started.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeat_failures: self.heartbeat_failures.load(Ordering::Relaxed),
            aborts_detected: self.aborts_detected.load(Ordering::Relaxed),
            async_aborts_sent: self.async_aborts_sent.load(Ordering::Relaxed),
        }
    }
}
