//! Configuration for Pulse
//!
//! TigerStyle: Explicit defaults, validation, reasonable limits.

use crate::constants::*;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for Pulse
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PulseConfig {
    /// Transaction coordinator configuration
    #[serde(default)]
    pub txn: TxnConfig,

    /// Cluster-wide settings seeded at startup
    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl PulseConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.txn.validate()?;
        Ok(())
    }
}

/// Transaction coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnConfig {
    /// Interval between transaction heartbeats (milliseconds)
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Always lay down a transaction record with the first write
    #[serde(default)]
    pub eager_record: bool,
}

fn default_heartbeat_interval_ms() -> u64 {
    HEARTBEAT_INTERVAL_MS_DEFAULT
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            eager_record: false,
        }
    }
}

impl TxnConfig {
    /// Heartbeat interval as a duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if !(HEARTBEAT_INTERVAL_MS_MIN..=HEARTBEAT_INTERVAL_MS_MAX)
            .contains(&self.heartbeat_interval_ms)
        {
            return Err(Error::invalid_configuration(
                "txn.heartbeat_interval_ms",
                format!(
                    "{} outside [{}, {}]",
                    self.heartbeat_interval_ms, HEARTBEAT_INTERVAL_MS_MIN, HEARTBEAT_INTERVAL_MS_MAX
                ),
            ));
        }
        Ok(())
    }
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Whether the cluster runs a version that creates transaction records lazily
    #[serde(default = "default_lazy_txn_record_enabled")]
    pub lazy_txn_record_enabled: bool,
}

fn default_lazy_txn_record_enabled() -> bool {
    true
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            lazy_txn_record_enabled: default_lazy_txn_record_enabled(),
        }
    }
}
