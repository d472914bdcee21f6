//! Fault injection for deterministic testing
//!
//! TigerStyle: Explicit fault types, probabilistic injection.
//!
//! The simulated cluster asks the injector once per batch, naming the
//! operation (`"heartbeat"` for gatekeeper traffic, `"batch"` for everything
//! sent through the wrapped sender).

use crate::rng::DeterministicRng;
use std::sync::atomic::{AtomicU64, Ordering};

/// Operation name for heartbeat traffic
pub const FAULT_OP_HEARTBEAT: &str = "heartbeat";
/// Operation name for foreground and cleanup traffic
pub const FAULT_OP_BATCH: &str = "batch";

/// Types of faults that can be injected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultType {
    // Transaction record faults
    /// A concurrent pusher aborts the transaction record before the request lands
    TxnRecordAbort,
    /// The transaction record is missing when the request lands
    TxnRecordLost,

    // Network faults
    /// The request fails without reaching the cluster
    RequestFail,
    /// The request is delayed on top of the base latency
    NetworkDelay { min_ms: u64, max_ms: u64 },
}

impl FaultType {
    /// Get a human-readable name for this fault type
    pub fn name(&self) -> &'static str {
        match self {
            FaultType::TxnRecordAbort => "txn_record_abort",
            FaultType::TxnRecordLost => "txn_record_lost",
            FaultType::RequestFail => "request_fail",
            FaultType::NetworkDelay { .. } => "network_delay",
        }
    }
}

/// Configuration for a fault injection rule
#[derive(Debug, Clone)]
pub struct FaultConfig {
    pub fault_type: FaultType,
    /// Probability of injection (0.0 - 1.0)
    pub probability: f64,
    /// Only inject into operations containing this string
    pub operation_filter: Option<String>,
    /// Only trigger after this many operations
    pub after_operations: u64,
    /// Maximum number of times to trigger
    pub max_triggers: Option<u64>,
    pub enabled: bool,
}

impl FaultConfig {
    pub fn new(fault_type: FaultType, probability: f64) -> Self {
        debug_assert!(
            (0.0..=1.0).contains(&probability),
            "probability must be in [0, 1]"
        );

        Self {
            fault_type,
            probability,
            operation_filter: None,
            after_operations: 0,
            max_triggers: None,
            enabled: true,
        }
    }

    /// Set an operation filter
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.operation_filter = Some(filter.into());
        self
    }

    /// Set the number of operations to wait before triggering
    pub fn after(mut self, operations: u64) -> Self {
        self.after_operations = operations;
        self
    }

    /// Set the maximum number of triggers
    pub fn max_triggers(mut self, max: u64) -> Self {
        self.max_triggers = Some(max);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Fault injector for deterministic testing
#[derive(Debug)]
pub struct FaultInjector {
    faults: Vec<FaultState>,
    rng: DeterministicRng,
    /// Total operations checked
    operation_count: AtomicU64,
}

#[derive(Debug)]
struct FaultState {
    config: FaultConfig,
    trigger_count: AtomicU64,
}

impl FaultInjector {
    pub fn new(rng: DeterministicRng) -> Self {
        Self {
            faults: Vec::new(),
            rng,
            operation_count: AtomicU64::new(0),
        }
    }

    pub fn register(&mut self, config: FaultConfig) {
        self.faults.push(FaultState {
            config,
            trigger_count: AtomicU64::new(0),
        });
    }

    /// Check if a fault should be injected for the given operation
    ///
    /// Rules are checked in registration order; the first one that fires wins.
    pub fn should_inject(&self, operation: &str) -> Option<FaultType> {
        let op_count = self.operation_count.fetch_add(1, Ordering::SeqCst);

        for fault_state in &self.faults {
            let config = &fault_state.config;

            if !config.enabled {
                continue;
            }
            if let Some(filter) = &config.operation_filter {
                if !operation.contains(filter.as_str()) {
                    continue;
                }
            }
            if op_count < config.after_operations {
                continue;
            }

            let trigger_count = fault_state.trigger_count.load(Ordering::SeqCst);
            if let Some(max) = config.max_triggers {
                if trigger_count >= max {
                    continue;
                }
            }

            if self.rng.next_bool(config.probability) {
                fault_state.trigger_count.fetch_add(1, Ordering::SeqCst);

                tracing::debug!(
                    fault = config.fault_type.name(),
                    operation = operation,
                    trigger_count = trigger_count + 1,
                    "Injecting fault"
                );

                return Some(config.fault_type.clone());
            }
        }

        None
    }

    pub fn operation_count(&self) -> u64 {
        self.operation_count.load(Ordering::SeqCst)
    }

    /// Get statistics for all registered faults
    pub fn stats(&self) -> Vec<FaultStats> {
        self.faults
            .iter()
            .map(|state| FaultStats {
                fault_type: state.config.fault_type.name().to_string(),
                probability: state.config.probability,
                trigger_count: state.trigger_count.load(Ordering::SeqCst),
                enabled: state.config.enabled,
            })
            .collect()
    }

    /// Total number of injected faults of the given kind
    pub fn trigger_count(&self, name: &str) -> u64 {
        self.stats()
            .iter()
            .filter(|s| s.fault_type == name)
            .map(|s| s.trigger_count)
            .sum()
    }
}

/// Statistics for a fault configuration
#[derive(Debug, Clone)]
pub struct FaultStats {
    pub fault_type: String,
    pub probability: f64,
    pub trigger_count: u64,
    pub enabled: bool,
}

/// Builder for creating a FaultInjector with multiple faults
pub struct FaultInjectorBuilder {
    rng: DeterministicRng,
    faults: Vec<FaultConfig>,
}

impl FaultInjectorBuilder {
    pub fn new(rng: DeterministicRng) -> Self {
        Self {
            rng,
            faults: Vec::new(),
        }
    }

    pub fn with_fault(mut self, config: FaultConfig) -> Self {
        self.faults.push(config);
        self
    }

    /// Add heartbeat faults: lost records and failed requests
    pub fn with_heartbeat_faults(self, probability: f64) -> Self {
        self.with_fault(
            FaultConfig::new(FaultType::TxnRecordLost, probability).with_filter(FAULT_OP_HEARTBEAT),
        )
        .with_fault(
            FaultConfig::new(FaultType::RequestFail, probability).with_filter(FAULT_OP_HEARTBEAT),
        )
    }

    /// Add network delays to every operation
    pub fn with_network_faults(self, probability: f64) -> Self {
        self.with_fault(FaultConfig::new(
            FaultType::NetworkDelay {
                min_ms: 10,
                max_ms: 100,
            },
            probability,
        ))
    }

    pub fn build(self) -> FaultInjector {
        let mut injector = FaultInjector::new(self.rng);
        for config in self.faults {
            injector.register(config);
        }
        injector
    }
}
