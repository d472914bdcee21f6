//! Simulation harness for deterministic testing
//!
//! TigerStyle: Reproducible test execution with explicit configuration.
//!
//! Every simulation runs on a fresh single-threaded tokio runtime with its
//! clock paused. Tasks are polled in spawn order and timers fire in deadline
//! order, so a seed fixes the whole run: transaction IDs, injected faults,
//! network delays, and the interleaving of heartbeats with foreground
//! traffic.

use crate::cluster::SimCluster;
use crate::coordinator::SimCoordinator;
use crate::fault::{FaultConfig, FaultInjector, FaultInjectorBuilder};
use crate::rng::DeterministicRng;
use crate::time::SimTime;
use pulse_core::{
    ClusterSettings, Stopper, TimeProvider, DST_NETWORK_LATENCY_MS_DEFAULT, DST_TIME_MS_MAX,
};
use pulse_txn::{HeartbeaterConfig, Timestamp, Transaction, TxnMetrics};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Simulated wall clock at the start of every run (2024-01-01T00:00:00Z)
const SIM_START_TIME_MS: u64 = 1_704_067_200_000;

/// Configuration for a simulation
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Maximum simulated time in milliseconds
    pub max_time_ms: u64,
    /// Network base latency in milliseconds
    pub network_latency_ms: u64,
    /// Network latency jitter in milliseconds
    pub network_jitter_ms: u64,
    /// Whether the simulated cluster runs with lazy transaction records
    pub lazy_txn_record: bool,
}

impl SimConfig {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            max_time_ms: DST_TIME_MS_MAX,
            network_latency_ms: DST_NETWORK_LATENCY_MS_DEFAULT,
            network_jitter_ms: 5,
            lazy_txn_record: true,
        }
    }

    /// Create config from DST_SEED environment variable or random
    pub fn from_env_or_random() -> Self {
        let seed = std::env::var("DST_SEED")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(rand::random);

        tracing::info!(seed = seed, "DST seed (set DST_SEED={} to replay)", seed);

        Self::new(seed)
    }

    /// Set maximum simulated time
    pub fn with_max_time_ms(mut self, ms: u64) -> Self {
        self.max_time_ms = ms;
        self
    }

    /// Set network latency
    pub fn with_network_latency(mut self, base_ms: u64, jitter_ms: u64) -> Self {
        self.network_latency_ms = base_ms;
        self.network_jitter_ms = jitter_ms;
        self
    }

    /// Run the cluster with or without lazy transaction records
    pub fn with_lazy_txn_record(mut self, enabled: bool) -> Self {
        self.lazy_txn_record = enabled;
        self
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Environment provided to simulation tests
pub struct SimEnvironment {
    pub rng: Arc<DeterministicRng>,
    pub time: Arc<SimTime>,
    /// Fault injector shared by the cluster
    pub faults: Arc<FaultInjector>,
    pub cluster: Arc<SimCluster>,
    /// The node's task scheduler; stopped when the run ends
    pub stopper: Stopper,
    pub settings: Arc<ClusterSettings>,
    pub metrics: Arc<TxnMetrics>,
}

impl SimEnvironment {
    /// Fork the RNG to create an independent stream
    pub fn fork_rng(&self) -> DeterministicRng {
        self.rng.fork()
    }

    /// Current simulated time in milliseconds since epoch
    pub fn now_ms(&self) -> u64 {
        self.time.now_ms()
    }

    /// Let simulated time pass
    pub async fn sleep_ms(&self, ms: u64) {
        self.time.sleep_ms(ms).await;
    }

    /// Start a new transaction with a seeded ID
    ///
    /// Fails if `config` carries a heartbeat interval outside the limits.
    pub fn coordinator(
        &self,
        name: &str,
        config: HeartbeaterConfig,
    ) -> pulse_core::Result<SimCoordinator> {
        let txn = Transaction::new(
            self.rng.next_uuid(),
            name,
            Timestamp::from_millis(self.now_ms()),
        );
        SimCoordinator::new(
            txn,
            config,
            &self.cluster,
            self.time.clone(),
            self.settings.clone(),
            self.stopper.clone(),
            self.metrics.clone(),
        )
    }
}

/// Main simulation harness
pub struct Simulation {
    config: SimConfig,
    fault_configs: Vec<FaultConfig>,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            fault_configs: Vec::new(),
        }
    }

    /// Add a fault configuration
    pub fn with_fault(mut self, fault: FaultConfig) -> Self {
        self.fault_configs.push(fault);
        self
    }

    /// Add multiple fault configurations
    pub fn with_faults(mut self, faults: Vec<FaultConfig>) -> Self {
        self.fault_configs.extend(faults);
        self
    }

    /// Run the simulation with the given test function
    ///
    /// Background tasks still running when the test returns are stopped
    /// before the runtime shuts down.
    pub fn run<F, Fut, T>(self, test: F) -> Result<T, SimulationError>
    where
        F: FnOnce(SimEnvironment) -> Fut,
        Fut: Future<Output = Result<T, pulse_core::Error>>,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .map_err(|e| SimulationError::RuntimeError(e.to_string()))?;

        let seed = self.config.seed;
        let max_time_ms = self.config.max_time_ms;
        runtime.block_on(async move {
            let env = self.build_environment();
            let stopper = env.stopper.clone();

            let outcome = tokio::time::timeout(Duration::from_millis(max_time_ms), test(env)).await;
            stopper.stop().await;

            match outcome {
                Ok(result) => result.map_err(SimulationError::TestFailed),
                Err(_) => {
                    tracing::error!(seed, max_time_ms, "simulation exceeded its time budget");
                    Err(SimulationError::MaxTimeExceeded { max_time_ms })
                }
            }
        })
    }

    /// Build the environment; must run inside the simulation runtime
    fn build_environment(self) -> SimEnvironment {
        let rng = Arc::new(DeterministicRng::new(self.config.seed));

        let mut fault_builder = FaultInjectorBuilder::new(rng.fork());
        for fault in self.fault_configs {
            fault_builder = fault_builder.with_fault(fault);
        }
        let faults = Arc::new(fault_builder.build());

        let time = Arc::new(SimTime::new(SIM_START_TIME_MS));
        let settings = Arc::new(ClusterSettings::new(self.config.lazy_txn_record));
        let cluster = Arc::new(
            SimCluster::new(rng.fork(), faults.clone(), time.clone(), settings.clone())
                .with_latency(self.config.network_latency_ms, self.config.network_jitter_ms),
        );

        SimEnvironment {
            rng,
            time,
            faults,
            cluster,
            stopper: Stopper::new(),
            settings,
            metrics: Arc::new(TxnMetrics::new()),
        }
    }
}

/// Errors that can occur during simulation
#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Test failed: {0}")]
    TestFailed(pulse_core::Error),

    #[error("Maximum simulation time of {max_time_ms}ms exceeded")]
    MaxTimeExceeded { max_time_ms: u64 },

    #[error("Runtime error: {0}")]
    RuntimeError(String),
}
