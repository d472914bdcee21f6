//! TigerStyle constants for Pulse
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Transaction Heartbeat
// =============================================================================

/// Default interval between transaction heartbeats in milliseconds (1 sec)
pub const HEARTBEAT_INTERVAL_MS_DEFAULT: u64 = 1000;

/// Minimum heartbeat interval in milliseconds
pub const HEARTBEAT_INTERVAL_MS_MIN: u64 = 10;

/// Maximum heartbeat interval in milliseconds (1 min)
pub const HEARTBEAT_INTERVAL_MS_MAX: u64 = 60 * 1000;

/// Time without a heartbeat after which other actors may consider a
/// transaction abandoned, in milliseconds (5 sec)
pub const TXN_ABANDONED_THRESHOLD_MS: u64 = 5 * HEARTBEAT_INTERVAL_MS_DEFAULT;

// =============================================================================
// Task Names
// =============================================================================

/// Name of the background task that heartbeats a transaction record
pub const TASK_NAME_HEARTBEAT_LOOP: &str = "txn heartbeater: heartbeat loop";

/// Name of the one-shot task that rolls back an aborted transaction
pub const TASK_NAME_ASYNC_ABORT: &str = "txn heartbeater: aborting txn";

// =============================================================================
// DST Limits
// =============================================================================

/// Maximum simulated time in milliseconds (24 hours)
pub const DST_TIME_MS_MAX: u64 = 24 * 60 * 60 * 1000;

/// Default simulated network latency in milliseconds
pub const DST_NETWORK_LATENCY_MS_DEFAULT: u64 = 1;

/// Default fault injection probability
pub const DST_FAULT_PROBABILITY_DEFAULT: f64 = 0.01;

// Compile-time assertions for constant validity
const _: () = {
    assert!(HEARTBEAT_INTERVAL_MS_MIN <= HEARTBEAT_INTERVAL_MS_DEFAULT);
    assert!(HEARTBEAT_INTERVAL_MS_DEFAULT <= HEARTBEAT_INTERVAL_MS_MAX);
    // Heartbeats must land well inside the abandonment window
    assert!(TXN_ABANDONED_THRESHOLD_MS > 2 * HEARTBEAT_INTERVAL_MS_DEFAULT);
};
