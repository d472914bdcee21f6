//! Pulse Core
//!
//! Core types, errors, constants and runtime plumbing shared by the Pulse
//! transactional key-value client.
//!
//! # TigerStyle
//!
//! This crate follows [TigerStyle](https://github.com/tigerbeetle/tigerbeetle/blob/main/docs/TIGER_STYLE.md)
//! engineering principles:
//! - Safety > Performance > Developer Experience
//! - Explicit limits with big-endian naming (e.g., `HEARTBEAT_INTERVAL_MS_MAX`)
//! - No recursion (bounded iteration only)

pub mod config;
pub mod constants;
pub mod error;
pub mod io;
pub mod runtime;
pub mod settings;
pub mod stopper;
pub mod telemetry;

pub use config::{ClusterConfig, PulseConfig, TxnConfig};
pub use constants::*;
pub use error::{Error, Result};
pub use io::{TimeProvider, WallClockTime};
pub use runtime::{current_runtime, CurrentRuntime, JoinError, JoinHandle, Runtime, TokioRuntime};
pub use settings::ClusterSettings;
pub use stopper::Stopper;
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
