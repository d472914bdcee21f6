//! Transaction request errors
//!
//! TigerStyle: Explicit error variants with context.
//!
//! `TxnError` is what a sender returns for a failed batch. It is `Clone`:
//! a terminal error recorded by an interceptor is handed to every later
//! caller.

use crate::api::{Method, Transaction};
use thiserror::Error;

/// Why the cluster rejected a request against a transaction record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatusReason {
    Unknown,
    /// No transaction record exists at the anchor key
    TxnNotFound,
    /// The record is already committed or aborted
    TxnFinalized,
}

/// The specific failure behind a `TxnError`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ErrorDetail {
    // =========================================================================
    // Cluster-reported errors
    // =========================================================================
    #[error("TransactionStatusError: {message} ({reason:?})")]
    TransactionStatus {
        reason: TransactionStatusReason,
        message: String,
    },

    #[error("TransactionAbortedError")]
    TransactionAborted,

    #[error("send failed: {reason}")]
    SendFailed { reason: String },

    // =========================================================================
    // Batch structure errors
    // =========================================================================
    #[error("{method} sent as non-terminal call")]
    NonTerminalCall { method: Method },

    // =========================================================================
    // Heartbeater terminal errors (never meant to reach a client)
    // =========================================================================
    #[error("heartbeat failed fatally")]
    HeartbeatFailed,

    #[error("txn heartbeater already closed")]
    HeartbeaterClosed,

    #[error("node already quiescing")]
    NodeQuiescing,

    #[error("cannot start async task: {reason}")]
    TaskRejected { reason: String },

    // =========================================================================
    // Internal errors
    // =========================================================================
    /// Internal state is corrupt; the component halts
    #[error("invariant violated: {message}")]
    InvariantViolation { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Error returned for a batch
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{detail}")]
pub struct TxnError {
    pub detail: ErrorDetail,
    /// Position of the offending request within the batch, if known
    pub index: Option<usize>,
    /// Updated transaction state carried by the error, if any
    pub txn: Option<Transaction>,
}

impl TxnError {
    pub fn new(detail: ErrorDetail) -> Self {
        Self {
            detail,
            index: None,
            txn: None,
        }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_txn(mut self, txn: Transaction) -> Self {
        self.txn = Some(txn);
        self
    }

    /// Create a "transaction record not found" error
    pub fn txn_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorDetail::TransactionStatus {
            reason: TransactionStatusReason::TxnNotFound,
            message: message.into(),
        })
    }

    /// Create a transaction aborted error
    pub fn txn_aborted() -> Self {
        Self::new(ErrorDetail::TransactionAborted)
    }

    /// Create a send failure error
    pub fn send_failed(reason: impl Into<String>) -> Self {
        Self::new(ErrorDetail::SendFailed {
            reason: reason.into(),
        })
    }

    /// Create a structural error for a request that must be last in its batch
    pub fn non_terminal(method: Method) -> Self {
        Self::new(ErrorDetail::NonTerminalCall { method })
    }

    /// Create an invariant violation error
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorDetail::InvariantViolation {
            message: message.into(),
        })
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorDetail::Internal {
            message: message.into(),
        })
    }

    /// Whether the heartbeat found no transaction record
    pub fn is_txn_not_found(&self) -> bool {
        matches!(
            self.detail,
            ErrorDetail::TransactionStatus {
                reason: TransactionStatusReason::TxnNotFound,
                ..
            }
        )
    }

    /// Whether the cluster reports the transaction as aborted
    pub fn is_txn_aborted(&self) -> bool {
        matches!(self.detail, ErrorDetail::TransactionAborted)
    }

    /// Whether this error reports corrupted internal state
    ///
    /// Unlike every other error, these are not recoverable: the component
    /// that produced one refuses all further work.
    pub fn is_fatal(&self) -> bool {
        matches!(self.detail, ErrorDetail::InvariantViolation { .. })
    }
}

impl From<pulse_core::Error> for TxnError {
    fn from(err: pulse_core::Error) -> Self {
        Self::new(ErrorDetail::TaskRejected {
            reason: err.to_string(),
        })
    }
}
