//! Transaction and batch message types
//!
//! These are the structured messages exchanged between a transaction
//! coordinator and the cluster. Wire encoding is owned elsewhere; the types
//! here only carry the fields the coordinator's interceptors inspect.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::TxnError;

// =============================================================================
// Keys and timestamps
// =============================================================================

/// A key in the key-value store
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Bytes);

impl Key {
    /// Create a key from raw bytes
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The empty key, used as "not yet assigned"
    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&'static str> for Key {
    fn from(s: &'static str) -> Self {
        Self(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<Vec<u8>> for Key {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0.escape_ascii())
    }
}

/// A hybrid timestamp: wall clock milliseconds plus a logical tiebreaker
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub wall_ms: u64,
    pub logical: u32,
}

impl Timestamp {
    pub fn new(wall_ms: u64, logical: u32) -> Self {
        Self { wall_ms, logical }
    }

    /// Timestamp for a physical clock reading
    pub fn from_millis(wall_ms: u64) -> Self {
        Self::new(wall_ms, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.wall_ms == 0 && self.logical == 0
    }

    /// Move this timestamp forward to `other` if `other` is later
    ///
    /// Returns true if the timestamp changed.
    pub fn forward(&mut self, other: Timestamp) -> bool {
        if other > *self {
            *self = other;
            true
        } else {
            false
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:010}", self.wall_ms, self.logical)
    }
}

// =============================================================================
// Transaction record
// =============================================================================

/// Status of a distributed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnStatus {
    Pending,
    Committed,
    Aborted,
}

impl TxnStatus {
    /// Committed and aborted transactions never change again
    pub fn is_finalized(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Committed => "COMMITTED",
            Self::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// The coordinator's mirror of a transaction record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction ID
    pub id: Uuid,
    /// Human-readable name for logging
    pub name: String,
    /// Anchor key addressing the transaction record; empty until first write
    pub key: Key,
    /// Incremented on every restart
    pub epoch: u32,
    pub status: TxnStatus,
    /// Provisional commit timestamp
    pub timestamp: Timestamp,
    /// Latest heartbeat the record is known to carry
    pub last_heartbeat: Timestamp,
    /// Whether a transaction record has been, or must be, written
    pub writing: bool,
}

impl Transaction {
    /// Create a new pending transaction
    pub fn new(id: Uuid, name: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            id,
            name: name.into(),
            key: Key::empty(),
            epoch: 0,
            status: TxnStatus::Pending,
            timestamp,
            last_heartbeat: Timestamp::default(),
            writing: false,
        }
    }

    /// First eight characters of the ID, for log lines
    pub fn short_id(&self) -> String {
        let mut id = self.id.simple().to_string();
        id.truncate(8);
        id
    }

    /// Merge a newer view of this transaction into the local one
    ///
    /// A finalized incoming status always wins, even over a different
    /// finalized local status. Epoch and timestamps only move forward. A
    /// record of another transaction is ignored.
    pub fn update(&mut self, other: Option<&Transaction>) {
        let Some(other) = other else {
            return;
        };

        if self.id.is_nil() {
            *self = other.clone();
            return;
        }
        if self.id != other.id {
            tracing::warn!(
                txn_id = %self.short_id(),
                other_id = %other.short_id(),
                "ignoring record of a different txn"
            );
            return;
        }

        if self.key.is_empty() {
            self.key = other.key.clone();
        }
        if self.name.is_empty() {
            self.name = other.name.clone();
        }
        if other.status.is_finalized() {
            self.status = other.status;
        }
        if self.epoch < other.epoch {
            self.epoch = other.epoch;
        }
        self.timestamp.forward(other.timestamp);
        self.last_heartbeat.forward(other.last_heartbeat);
        self.writing = self.writing || other.writing;
    }

    /// Restart the transaction at a higher epoch
    pub fn bump_epoch(&mut self) {
        self.epoch = self.epoch.saturating_add(1);
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} id={} key={} epoch={} status={} ts={} hb={}",
            self.name,
            self.short_id(),
            self.key,
            self.epoch,
            self.status,
            self.timestamp,
            self.last_heartbeat
        )
    }
}

// =============================================================================
// Requests and responses
// =============================================================================

/// Request method, used for logging and error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Scan,
    Put,
    ConditionalPut,
    Delete,
    DeleteRange,
    BeginTransaction,
    EndTransaction,
    HeartbeatTxn,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A single request in a batch
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Get {
        key: Key,
    },
    Scan {
        key: Key,
        end_key: Key,
    },
    Put {
        key: Key,
        value: Bytes,
    },
    ConditionalPut {
        key: Key,
        value: Bytes,
        expected: Option<Bytes>,
    },
    Delete {
        key: Key,
    },
    DeleteRange {
        key: Key,
        end_key: Key,
    },
    /// Lays down a PENDING transaction record at `key`
    BeginTransaction {
        key: Key,
    },
    /// Commits or rolls back the transaction whose record lives at `key`
    EndTransaction {
        key: Key,
        commit: bool,
        /// Leave abort markers behind when resolving intents
        poison: bool,
    },
    /// Extends the last-heartbeat timestamp of the record at `key`
    HeartbeatTxn {
        key: Key,
        now: Timestamp,
    },
}

impl Request {
    pub fn get(key: impl Into<Key>) -> Self {
        Self::Get { key: key.into() }
    }

    pub fn put(key: impl Into<Key>, value: impl Into<Bytes>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Key>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn end_transaction(key: impl Into<Key>, commit: bool) -> Self {
        Self::EndTransaction {
            key: key.into(),
            commit,
            poison: false,
        }
    }

    pub fn method(&self) -> Method {
        match self {
            Self::Get { .. } => Method::Get,
            Self::Scan { .. } => Method::Scan,
            Self::Put { .. } => Method::Put,
            Self::ConditionalPut { .. } => Method::ConditionalPut,
            Self::Delete { .. } => Method::Delete,
            Self::DeleteRange { .. } => Method::DeleteRange,
            Self::BeginTransaction { .. } => Method::BeginTransaction,
            Self::EndTransaction { .. } => Method::EndTransaction,
            Self::HeartbeatTxn { .. } => Method::HeartbeatTxn,
        }
    }

    /// The key this request is addressed to
    pub fn key(&self) -> &Key {
        match self {
            Self::Get { key }
            | Self::Scan { key, .. }
            | Self::Put { key, .. }
            | Self::ConditionalPut { key, .. }
            | Self::Delete { key }
            | Self::DeleteRange { key, .. }
            | Self::BeginTransaction { key }
            | Self::EndTransaction { key, .. }
            | Self::HeartbeatTxn { key, .. } => key,
        }
    }

    /// Whether this request lays down a write intent
    ///
    /// Transaction-record requests are not intent writes.
    pub fn is_transactional_write(&self) -> bool {
        matches!(
            self,
            Self::Put { .. }
                | Self::ConditionalPut { .. }
                | Self::Delete { .. }
                | Self::DeleteRange { .. }
        )
    }
}

/// A single response in a batch, positionally matching its request
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Get { value: Option<Bytes> },
    Scan { rows: Vec<(Key, Bytes)> },
    Put,
    ConditionalPut,
    Delete,
    DeleteRange { keys: Vec<Key> },
    BeginTransaction,
    EndTransaction { one_phase_commit: bool },
    HeartbeatTxn { txn: Transaction },
}

impl Response {
    pub fn method(&self) -> Method {
        match self {
            Self::Get { .. } => Method::Get,
            Self::Scan { .. } => Method::Scan,
            Self::Put => Method::Put,
            Self::ConditionalPut => Method::ConditionalPut,
            Self::Delete => Method::Delete,
            Self::DeleteRange { .. } => Method::DeleteRange,
            Self::BeginTransaction => Method::BeginTransaction,
            Self::EndTransaction { .. } => Method::EndTransaction,
            Self::HeartbeatTxn { .. } => Method::HeartbeatTxn,
        }
    }
}

// =============================================================================
// Batches
// =============================================================================

/// An ordered batch of requests sent on behalf of a transaction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchRequest {
    /// The sender's copy of the transaction; None for non-transactional batches
    pub txn: Option<Transaction>,
    pub requests: Vec<Request>,
}

impl BatchRequest {
    pub fn new(txn: Option<Transaction>) -> Self {
        Self {
            txn,
            requests: Vec::new(),
        }
    }

    /// Build a batch from a list of requests
    pub fn with_requests(txn: Option<Transaction>, requests: Vec<Request>) -> Self {
        Self { txn, requests }
    }

    pub fn push(&mut self, request: Request) -> &mut Self {
        self.requests.push(request);
        self
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// First request with the given method
    pub fn get(&self, method: Method) -> Option<&Request> {
        self.requests.iter().find(|r| r.method() == method)
    }

    pub fn has_end_transaction(&self) -> bool {
        self.get(Method::EndTransaction).is_some()
    }

    /// Whether the batch is exactly one EndTransaction request
    pub fn is_single_end_transaction(&self) -> bool {
        matches!(self.requests.as_slice(), [Request::EndTransaction { .. }])
    }

    /// Whether the batch is exactly one EndTransaction(commit=false) request
    pub fn is_single_rollback(&self) -> bool {
        matches!(
            self.requests.as_slice(),
            [Request::EndTransaction { commit: false, .. }]
        )
    }

    /// Index of the first transactional write, if any
    ///
    /// Also validates that an EndTransaction request, if present, is the
    /// last request in the batch.
    pub fn first_write_index(&self) -> Result<Option<usize>, TxnError> {
        let last = self.requests.len().saturating_sub(1);
        if let Some(pos) = self
            .requests
            .iter()
            .position(|r| r.method() == Method::EndTransaction)
        {
            if pos != last {
                return Err(TxnError::non_terminal(Method::EndTransaction).with_index(pos));
            }
        }
        Ok(self
            .requests
            .iter()
            .position(Request::is_transactional_write))
    }
}

/// Responses for a batch, positionally matching its requests
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResponse {
    pub responses: Vec<Response>,
    /// Updated transaction state returned by the cluster
    pub txn: Option<Transaction>,
}

impl BatchResponse {
    pub fn new(responses: Vec<Response>) -> Self {
        Self {
            responses,
            txn: None,
        }
    }
}

/// Coordinator metadata exchanged between interceptors, e.g. when a
/// transaction moves between coordinators
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxnCoordMeta {
    pub txn: Option<Transaction>,
    /// Keys of intents written so far
    pub intents: Vec<Key>,
}
