//! Time abstraction for deterministic simulation testing
//!
//! TigerStyle: All clock reads and timed waits go through `TimeProvider`.
//!
//! - `WallClockTime`: production, system clock + tokio timers
//! - `SimTime` (in pulse-dst): virtual time, deterministic
//!
//! The heartbeater reads `now_ms` to stamp heartbeat requests and waits on
//! `sleep_ms` between heartbeats, so the same loop runs in both modes.

use async_trait::async_trait;
use std::time::{SystemTime, UNIX_EPOCH};

/// Time provider abstraction for DST
///
/// Never use `std::time::SystemTime::now()` directly in coordinator code.
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Get current time in milliseconds since epoch
    fn now_ms(&self) -> u64;

    /// Sleep for the specified duration
    async fn sleep_ms(&self, ms: u64);
}

/// Production time provider using wall clock
#[derive(Debug, Clone, Default)]
pub struct WallClockTime;

impl WallClockTime {
    /// Create a new wall clock time provider
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TimeProvider for WallClockTime {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    async fn sleep_ms(&self, ms: u64) {
        tokio::time::sleep(tokio::time::Duration::from_millis(ms)).await;
    }
}
