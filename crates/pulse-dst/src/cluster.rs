//! Simulated cluster
//!
//! TigerStyle: Server-side state is explicit and inspectable.
//!
//! `SimCluster` stands in for everything below a coordinator's interceptor
//! chain. It keeps transaction records, per-transaction intents, and
//! committed data, and evaluates batches the way the cluster would. It
//! serves two sender roles, the gatekeeper (heartbeats) and the wrapped
//! sender (everything else), and logs every batch per role.
//!
//! Each send releases the coordinator lock for the simulated network
//! latency, so foreground traffic and heartbeats interleave the way they
//! do against a real cluster.

use crate::fault::{FaultInjector, FaultType, FAULT_OP_BATCH, FAULT_OP_HEARTBEAT};
use crate::rng::DeterministicRng;
use async_trait::async_trait;
use bytes::Bytes;
use pulse_core::{ClusterSettings, TimeProvider, TXN_ABANDONED_THRESHOLD_MS};
use pulse_txn::{
    BatchRequest, BatchResponse, ErrorDetail, Key, LockedSender, Request, Response, SendResult,
    Timestamp, Transaction, TransactionStatusReason, TxnError, TxnGuard, TxnStatus,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Which sender of the coordinator's chain a batch came through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderRole {
    Gatekeeper,
    Wrapped,
}

impl SenderRole {
    fn fault_op(&self) -> &'static str {
        match self {
            SenderRole::Gatekeeper => FAULT_OP_HEARTBEAT,
            SenderRole::Wrapped => FAULT_OP_BATCH,
        }
    }
}

/// A batch as received by the cluster
#[derive(Debug, Clone)]
pub struct SentBatch {
    pub role: SenderRole,
    pub batch: BatchRequest,
    pub sent_at_ms: u64,
}

/// Simulated cluster state and request evaluation
pub struct SimCluster {
    state: Mutex<ClusterState>,
    rng: DeterministicRng,
    faults: Arc<FaultInjector>,
    time: Arc<dyn TimeProvider>,
    settings: Arc<ClusterSettings>,
    latency_ms: u64,
    jitter_ms: u64,
}

#[derive(Debug, Default)]
struct ClusterState {
    records: HashMap<Uuid, Transaction>,
    /// Provisional writes per transaction; `None` is a deletion
    intents: HashMap<Uuid, Vec<(Key, Option<Bytes>)>>,
    data: BTreeMap<Key, Bytes>,
    /// Keys an aborted transaction may no longer touch
    abort_spans: HashSet<(Uuid, Key)>,
    sent: Vec<SentBatch>,
}

impl SimCluster {
    pub fn new(
        rng: DeterministicRng,
        faults: Arc<FaultInjector>,
        time: Arc<dyn TimeProvider>,
        settings: Arc<ClusterSettings>,
    ) -> Self {
        Self {
            state: Mutex::new(ClusterState::default()),
            rng,
            faults,
            time,
            settings,
            latency_ms: pulse_core::DST_NETWORK_LATENCY_MS_DEFAULT,
            jitter_ms: 0,
        }
    }

    /// Set the base network latency and jitter
    pub fn with_latency(mut self, base_ms: u64, jitter_ms: u64) -> Self {
        self.latency_ms = base_ms;
        self.jitter_ms = jitter_ms;
        self
    }

    /// Sender for heartbeat traffic
    pub fn gatekeeper(self: &Arc<Self>) -> Arc<dyn LockedSender> {
        Arc::new(ClusterSender {
            cluster: Arc::clone(self),
            role: SenderRole::Gatekeeper,
        })
    }

    /// Sender for foreground and cleanup traffic
    pub fn wrapped(self: &Arc<Self>) -> Arc<dyn LockedSender> {
        Arc::new(ClusterSender {
            cluster: Arc::clone(self),
            role: SenderRole::Wrapped,
        })
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Inspection and outside interference
    // =========================================================================

    /// The transaction record, if one exists
    pub fn record(&self, txn_id: Uuid) -> Option<Transaction> {
        self.state().records.get(&txn_id).cloned()
    }

    /// Committed value of a key
    pub fn value(&self, key: &Key) -> Option<Bytes> {
        self.state().data.get(key).cloned()
    }

    /// Number of unresolved intents of a transaction
    pub fn intent_count(&self, txn_id: Uuid) -> usize {
        self.state().intents.get(&txn_id).map_or(0, Vec::len)
    }

    /// Whether an abort span marks `key` for the transaction
    pub fn is_poisoned(&self, txn_id: Uuid, key: &Key) -> bool {
        self.state().abort_spans.contains(&(txn_id, key.clone()))
    }

    /// Every batch received so far
    pub fn sent(&self) -> Vec<SentBatch> {
        self.state().sent.clone()
    }

    /// Batches received through one role
    pub fn sent_by(&self, role: SenderRole) -> Vec<BatchRequest> {
        self.state()
            .sent
            .iter()
            .filter(|s| s.role == role)
            .map(|s| s.batch.clone())
            .collect()
    }

    /// Abort a pending transaction as a concurrent pusher would
    ///
    /// Writes an aborted record if none exists yet.
    pub fn abort_txn(&self, txn: &Transaction) {
        let mut state = self.state();
        let record = state.records.entry(txn.id).or_insert_with(|| txn.clone());
        if record.status == TxnStatus::Pending {
            record.status = TxnStatus::Aborted;
            tracing::debug!(txn_id = %record.short_id(), "sim cluster aborted txn record");
        }
    }

    /// Abort every pending record that has gone quiet, as a pusher would
    ///
    /// A record is abandoned once neither its last heartbeat nor its
    /// timestamp is within `TXN_ABANDONED_THRESHOLD_MS` of now. Returns the
    /// aborted IDs in order.
    pub fn abort_abandoned(&self) -> Vec<Uuid> {
        let now_ms = self.time.now_ms();
        let mut state = self.state();
        let mut aborted: Vec<Uuid> = state
            .records
            .values_mut()
            .filter(|record| record.status == TxnStatus::Pending)
            .filter(|record| {
                let last_active = record.last_heartbeat.max(record.timestamp);
                now_ms.saturating_sub(last_active.wall_ms) > TXN_ABANDONED_THRESHOLD_MS
            })
            .map(|record| {
                record.status = TxnStatus::Aborted;
                tracing::debug!(txn_id = %record.short_id(), "sim cluster aborted abandoned txn");
                record.id
            })
            .collect();
        aborted.sort();
        aborted
    }

    // =========================================================================
    // Request path
    // =========================================================================

    async fn send(&self, role: SenderRole, guard: TxnGuard, ba: BatchRequest) -> (TxnGuard, SendResult) {
        let op = role.fault_op();
        self.state().sent.push(SentBatch {
            role,
            batch: ba.clone(),
            sent_at_ms: self.time.now_ms(),
        });

        let fault = self.faults.should_inject(op);
        let mut delay_ms = self.latency_ms;
        if self.jitter_ms > 0 {
            delay_ms += self.rng.next_range(0, self.jitter_ms + 1);
        }
        if let Some(FaultType::NetworkDelay { min_ms, max_ms }) = &fault {
            delay_ms += self.rng.next_range(*min_ms, *max_ms + 1);
        }

        // Other requests of the same coordinator proceed while this one is in flight
        let (guard, ()) = guard.unlocked(self.time.sleep_ms(delay_ms)).await;

        let result = match fault {
            Some(FaultType::RequestFail) => Err(TxnError::send_failed(format!("injected {} failure", op))),
            Some(fault) => {
                self.apply_record_fault(&fault, &ba);
                self.evaluate(&ba)
            }
            None => self.evaluate(&ba),
        };
        (guard, result)
    }

    fn apply_record_fault(&self, fault: &FaultType, ba: &BatchRequest) {
        let Some(txn) = ba.txn.as_ref() else {
            return;
        };
        match fault {
            FaultType::TxnRecordAbort => self.abort_txn(txn),
            FaultType::TxnRecordLost => {
                self.state().records.remove(&txn.id);
            }
            FaultType::RequestFail | FaultType::NetworkDelay { .. } => {}
        }
    }

    /// Evaluate a batch in order, stopping at the first failing request
    fn evaluate(&self, ba: &BatchRequest) -> SendResult {
        let Some(txn) = ba.txn.as_ref() else {
            return Err(TxnError::internal("sim cluster only serves transactional batches"));
        };
        let now = Timestamp::from_millis(self.time.now_ms());
        let lazy_records = self.settings.is_lazy_txn_record_active();

        let mut state = self.state();
        let mut responses = Vec::with_capacity(ba.len());
        for (index, request) in ba.requests.iter().enumerate() {
            let response = state
                .evaluate(txn, request, now, lazy_records)
                .map_err(|err| err.with_index(index))?;
            responses.push(response);
        }

        let mut br = BatchResponse::new(responses);
        br.txn = Some(state.records.get(&txn.id).cloned().unwrap_or_else(|| txn.clone()));
        Ok(br)
    }
}

impl ClusterState {
    fn evaluate(
        &mut self,
        txn: &Transaction,
        request: &Request,
        now: Timestamp,
        lazy_records: bool,
    ) -> Result<Response, TxnError> {
        match request {
            Request::Get { key } => Ok(Response::Get {
                value: self.read(txn, key)?,
            }),
            Request::Scan { key, end_key } => {
                let rows = self
                    .span(key, end_key)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Ok(Response::Scan { rows })
            }
            Request::Put { key, value } => {
                self.write(txn, key, Some(value.clone()))?;
                Ok(Response::Put)
            }
            Request::ConditionalPut {
                key,
                value,
                expected,
            } => {
                if self.read(txn, key)? != *expected {
                    return Err(TxnError::send_failed(format!("condition failed on {}", key)));
                }
                self.write(txn, key, Some(value.clone()))?;
                Ok(Response::ConditionalPut)
            }
            Request::Delete { key } => {
                self.write(txn, key, None)?;
                Ok(Response::Delete)
            }
            Request::DeleteRange { key, end_key } => {
                let keys: Vec<Key> = self.span(key, end_key).map(|(k, _)| k.clone()).collect();
                for k in &keys {
                    self.write(txn, k, None)?;
                }
                Ok(Response::DeleteRange { keys })
            }
            Request::BeginTransaction { key } => self.begin(txn, key, now),
            Request::EndTransaction { commit, poison, .. } => self.end(txn, *commit, *poison),
            Request::HeartbeatTxn { now, .. } => self.heartbeat(txn, *now, lazy_records),
        }
    }

    /// Committed rows in [key, end_key)
    fn span<'a>(&'a self, key: &Key, end_key: &Key) -> impl Iterator<Item = (&'a Key, &'a Bytes)> + 'a {
        let end = if end_key < key { key.clone() } else { end_key.clone() };
        self.data.range(key.clone()..end)
    }

    /// Fail if the transaction can no longer do work
    fn check_live(&self, txn: &Transaction, key: Option<&Key>) -> Result<(), TxnError> {
        if let Some(key) = key {
            if self.abort_spans.contains(&(txn.id, key.clone())) {
                return Err(TxnError::txn_aborted());
            }
        }
        match self.records.get(&txn.id) {
            Some(record) if record.status == TxnStatus::Aborted => {
                Err(TxnError::txn_aborted().with_txn(record.clone()))
            }
            Some(record) if record.status == TxnStatus::Committed => Err(finalized(record)),
            _ => Ok(()),
        }
    }

    fn read(&self, txn: &Transaction, key: &Key) -> Result<Option<Bytes>, TxnError> {
        self.check_live(txn, Some(key))?;
        // Reads see the transaction's own latest write
        let own = self
            .intents
            .get(&txn.id)
            .and_then(|intents| intents.iter().rev().find(|(k, _)| k == key));
        Ok(match own {
            Some((_, value)) => value.clone(),
            None => self.data.get(key).cloned(),
        })
    }

    fn write(&mut self, txn: &Transaction, key: &Key, value: Option<Bytes>) -> Result<(), TxnError> {
        self.check_live(txn, Some(key))?;
        self.intents
            .entry(txn.id)
            .or_default()
            .push((key.clone(), value));
        Ok(())
    }

    fn begin(&mut self, txn: &Transaction, key: &Key, now: Timestamp) -> Result<Response, TxnError> {
        self.check_live(txn, None)?;
        match self.records.get_mut(&txn.id) {
            // A restarted transaction re-establishes its record at a higher epoch
            Some(record) => {
                record.epoch = record.epoch.max(txn.epoch);
                record.timestamp.forward(txn.timestamp);
            }
            None => {
                let mut record = txn.clone();
                record.key = key.clone();
                record.status = TxnStatus::Pending;
                record.writing = true;
                record.last_heartbeat.forward(now);
                self.records.insert(txn.id, record);
            }
        }
        Ok(Response::BeginTransaction)
    }

    fn end(&mut self, txn: &Transaction, commit: bool, poison: bool) -> Result<Response, TxnError> {
        let existed = self.records.contains_key(&txn.id);
        let record = self.records.entry(txn.id).or_insert_with(|| {
            let mut record = txn.clone();
            record.status = TxnStatus::Pending;
            record
        });

        match record.status {
            TxnStatus::Committed => return Err(finalized(record)),
            TxnStatus::Aborted if commit => {
                return Err(TxnError::txn_aborted().with_txn(record.clone()));
            }
            TxnStatus::Aborted | TxnStatus::Pending => {}
        }

        let intents = self.intents.remove(&txn.id).unwrap_or_default();
        if commit {
            record.status = TxnStatus::Committed;
            for (key, value) in intents {
                match value {
                    Some(value) => self.data.insert(key, value),
                    None => self.data.remove(&key),
                };
            }
        } else {
            record.status = TxnStatus::Aborted;
            if poison {
                self.abort_spans
                    .extend(intents.into_iter().map(|(key, _)| (txn.id, key)));
            }
        }

        Ok(Response::EndTransaction {
            one_phase_commit: commit && !existed,
        })
    }

    fn heartbeat(&mut self, txn: &Transaction, now: Timestamp, lazy_records: bool) -> Result<Response, TxnError> {
        if !self.records.contains_key(&txn.id) {
            // Only clusters with lazy records create one on heartbeat
            if !lazy_records {
                return Err(TxnError::txn_not_found(format!(
                    "txn record for {} not found",
                    txn.short_id()
                )));
            }
            let mut record = txn.clone();
            record.status = TxnStatus::Pending;
            self.records.insert(txn.id, record);
        }

        let Some(record) = self.records.get_mut(&txn.id) else {
            return Err(TxnError::internal("txn record vanished"));
        };
        if record.status == TxnStatus::Pending {
            record.last_heartbeat.forward(now);
        }
        Ok(Response::HeartbeatTxn {
            txn: record.clone(),
        })
    }
}

fn finalized(record: &Transaction) -> TxnError {
    TxnError::new(ErrorDetail::TransactionStatus {
        reason: TransactionStatusReason::TxnFinalized,
        message: format!("txn {} already {}", record.short_id(), record.status),
    })
    .with_txn(record.clone())
}

/// One role of the cluster, as seen by a coordinator
struct ClusterSender {
    cluster: Arc<SimCluster>,
    role: SenderRole,
}

#[async_trait]
impl LockedSender for ClusterSender {
    async fn send_locked(&self, guard: TxnGuard, ba: BatchRequest) -> (TxnGuard, SendResult) {
        self.cluster.send(self.role, guard, ba).await
    }
}
