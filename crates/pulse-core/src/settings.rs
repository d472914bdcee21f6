//! Runtime cluster settings
//!
//! Settings can flip while the process runs (e.g. after a cluster version
//! upgrade finalizes), so they are read on every use rather than captured.

use crate::config::ClusterConfig;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cluster settings shared by every coordinator on a node
#[derive(Debug)]
pub struct ClusterSettings {
    lazy_txn_record: AtomicBool,
}

impl ClusterSettings {
    /// Create settings with the lazy transaction record optimization on or off
    pub fn new(lazy_txn_record: bool) -> Self {
        Self {
            lazy_txn_record: AtomicBool::new(lazy_txn_record),
        }
    }

    /// Create settings from configuration
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(config.lazy_txn_record_enabled)
    }

    /// Whether the running cluster version creates transaction records lazily
    ///
    /// When false, every writing transaction must send an explicit begin
    /// request ahead of its first write.
    pub fn is_lazy_txn_record_active(&self) -> bool {
        self.lazy_txn_record.load(Ordering::Acquire)
    }

    /// Toggle the lazy transaction record optimization
    pub fn set_lazy_txn_record_active(&self, active: bool) {
        self.lazy_txn_record.store(active, Ordering::Release);
    }
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self::from_config(&ClusterConfig::default())
    }
}
