//! Pulse Transactions
//!
//! Client-side transaction coordination for the Pulse key-value client:
//! batch and transaction message types, the locked sender chain, and the
//! transaction heartbeater interceptor.
//!
//! # Overview
//!
//! A coordinator owns one [`TxnLock`] per transaction. Every interceptor in
//! its chain implements [`LockedSender`] and receives the held lock with each
//! batch. The [`TxnHeartbeater`] sits in that chain: it anchors writing
//! transactions, injects `BeginTransaction` when the cluster needs one, and
//! keeps the transaction record alive from a background loop.

pub mod api;
pub mod error;
pub mod heartbeater;
pub mod lock;
pub mod metrics;
pub mod sender;

pub use api::{
    BatchRequest, BatchResponse, Key, Method, Request, Response, Timestamp, Transaction,
    TxnCoordMeta, TxnStatus,
};
pub use error::{ErrorDetail, TransactionStatusReason, TxnError};
pub use heartbeater::{
    AsyncAbortCallback, HeartbeatLocked, HeartbeaterConfig, HeartbeaterDeps, TxnHeartbeater,
};
pub use lock::{TxnCoordState, TxnGuard, TxnLock};
pub use metrics::{TxnMetrics, TxnMetricsSnapshot};
pub use sender::{LockedSender, SendResult, TxnInterceptor};
