//! Simulated time
//!
//! TigerStyle: Explicit time control, trait-based abstraction.
//!
//! `SimTime` reads tokio's clock, which the simulation runtime starts
//! paused. Paused time only moves when every task is idle, and then jumps
//! straight to the next timer, so heartbeat intervals cost no wall time
//! and fire in the same order on every run.

use async_trait::async_trait;
use pulse_core::TimeProvider;
use std::time::Duration;
use tokio::time::Instant;

/// Simulated time provider for DST
///
/// Must be created inside the simulation runtime.
#[derive(Debug, Clone)]
pub struct SimTime {
    origin: Instant,
    /// Milliseconds since epoch reported at `origin`
    start_ms: u64,
}

impl SimTime {
    pub fn new(start_ms: u64) -> Self {
        Self {
            origin: Instant::now(),
            start_ms,
        }
    }

    /// Simulated milliseconds elapsed since creation
    pub fn elapsed_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

#[async_trait]
impl TimeProvider for SimTime {
    fn now_ms(&self) -> u64 {
        self.start_ms + self.elapsed_ms()
    }

    async fn sleep_ms(&self, ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}
