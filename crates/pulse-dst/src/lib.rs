//! Pulse DST - Deterministic Simulation Testing
//!
//! FoundationDB-style deterministic simulation for the transaction
//! heartbeater.
//!
//! # Overview
//!
//! DST runs coordinators against a simulated cluster with:
//! - Paused, virtual time (SimTime)
//! - Reproducible random numbers (DeterministicRng)
//! - Fault injection on heartbeats and foreground batches (FaultInjector)
//! - Inspectable cluster state: records, intents, per-sender traffic (SimCluster)
//!
//! # Example
//!
//! ```rust,ignore
//! use pulse_dst::{FaultConfig, FaultType, SimConfig, Simulation, FAULT_OP_HEARTBEAT};
//!
//! #[test]
//! fn test_with_faults() {
//!     let config = SimConfig::from_env_or_random();
//!     Simulation::new(config)
//!         .with_fault(FaultConfig::new(FaultType::RequestFail, 0.1).with_filter(FAULT_OP_HEARTBEAT))
//!         .run(|env| async move {
//!             let coord = env.coordinator("writer", Default::default())?;
//!             coord.put("a", "1").await.ok();
//!             Ok(())
//!         })
//!         .unwrap();
//! }
//! ```
//!
//! # TigerStyle
//!
//! - All operations are deterministic given the same seed
//! - Always log the seed for reproducibility
//! - Explicit fault types and probabilities

pub mod cluster;
pub mod coordinator;
pub mod fault;
pub mod rng;
pub mod simulation;
pub mod time;

pub use cluster::{SentBatch, SenderRole, SimCluster};
pub use coordinator::SimCoordinator;
pub use fault::{
    FaultConfig, FaultInjector, FaultInjectorBuilder, FaultStats, FaultType, FAULT_OP_BATCH,
    FAULT_OP_HEARTBEAT,
};
pub use rng::DeterministicRng;
pub use simulation::{SimConfig, SimEnvironment, Simulation, SimulationError};
pub use time::SimTime;
