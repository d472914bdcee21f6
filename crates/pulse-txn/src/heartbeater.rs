//! Transaction heartbeater
//!
//! TigerStyle: Explicit task lifecycle, graceful shutdown via channel.
//!
//! The heartbeater is the interceptor that keeps a writing transaction's
//! record alive. On the first write of an epoch it anchors the transaction,
//! optionally splices a `BeginTransaction` ahead of that write, and starts a
//! background loop that heartbeats the record through the gatekeeper sender.
//! When a heartbeat learns the transaction was aborted, it notifies the
//! coordinator and rolls the transaction back through the wrapped sender so
//! its intents get cleaned up.
//!
//! All bookkeeping lives in [`HeartbeatLocked`] inside the coordinator's
//! locked state. The loop itself only holds the lock while it does
//! bookkeeping; the gatekeeper releases it for the network round trip.

use crate::api::{BatchRequest, Method, Request, Response, Timestamp, TxnCoordMeta, TxnStatus};
use crate::error::{ErrorDetail, TxnError};
use crate::lock::{TxnCoordState, TxnGuard, TxnLock};
use crate::metrics::TxnMetrics;
use crate::sender::{LockedSender, SendResult, TxnInterceptor};
use async_trait::async_trait;
use pulse_core::{
    ClusterSettings, Stopper, TimeProvider, TxnConfig, HEARTBEAT_INTERVAL_MS_MAX,
    HEARTBEAT_INTERVAL_MS_MIN, TASK_NAME_ASYNC_ABORT, TASK_NAME_HEARTBEAT_LOOP,
};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::Instrument;

/// Called with the lock held when a heartbeat finds the transaction aborted,
/// before the cleanup rollback is scheduled
pub type AsyncAbortCallback = Arc<dyn Fn(&mut TxnCoordState) + Send + Sync>;

// =============================================================================
// Configuration and collaborators
// =============================================================================

/// Per-attempt heartbeater configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeaterConfig {
    /// Time between heartbeats
    pub heartbeat_interval: Duration,
    /// Always send an explicit `BeginTransaction` ahead of the first write
    pub eager_record: bool,
}

impl From<&TxnConfig> for HeartbeaterConfig {
    fn from(config: &TxnConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            eager_record: config.eager_record,
        }
    }
}

impl Default for HeartbeaterConfig {
    fn default() -> Self {
        Self::from(&TxnConfig::default())
    }
}

impl HeartbeaterConfig {
    /// Reject intervals outside the heartbeat limits
    ///
    /// A zero interval would make the loop send heartbeats back to back.
    pub fn validate(&self) -> pulse_core::Result<()> {
        let interval_ms = self.heartbeat_interval.as_millis();
        if interval_ms < u128::from(HEARTBEAT_INTERVAL_MS_MIN)
            || interval_ms > u128::from(HEARTBEAT_INTERVAL_MS_MAX)
        {
            return Err(pulse_core::Error::invalid_configuration(
                "heartbeat_interval",
                format!(
                    "{}ms outside [{}, {}]",
                    interval_ms, HEARTBEAT_INTERVAL_MS_MIN, HEARTBEAT_INTERVAL_MS_MAX
                ),
            ));
        }
        Ok(())
    }
}

/// Everything the heartbeater talks to
#[derive(Clone)]
pub struct HeartbeaterDeps {
    /// The coordinator lock guarding the transaction state
    pub lock: TxnLock,
    /// Sender for heartbeats; bypasses every other interceptor
    pub gatekeeper: Arc<dyn LockedSender>,
    pub clock: Arc<dyn TimeProvider>,
    pub settings: Arc<ClusterSettings>,
    pub stopper: Stopper,
    pub metrics: Arc<TxnMetrics>,
    pub on_async_abort: AsyncAbortCallback,
}

// =============================================================================
// Locked state
// =============================================================================

/// Heartbeater bookkeeping, guarded by the coordinator lock
#[derive(Debug)]
pub struct HeartbeatLocked {
    /// Whether the next write in this epoch must establish the txn record
    need_begin_txn: bool,
    /// Present while a heartbeat loop runs; dropping it stops the loop
    txn_end: Option<LoopHandle>,
    /// Once set, every request except a rollback is rejected with this
    final_err: Option<TxnError>,
    /// Bumped by every reset so loops of earlier attempts can be told apart
    attempt: u64,
    next_loop_id: u64,
}

#[derive(Debug)]
struct LoopHandle {
    id: u64,
    _closer: oneshot::Sender<()>,
}

impl HeartbeatLocked {
    pub fn new() -> Self {
        Self {
            need_begin_txn: true,
            txn_end: None,
            final_err: None,
            attempt: 0,
            next_loop_id: 0,
        }
    }

    pub fn need_begin_txn(&self) -> bool {
        self.need_begin_txn
    }

    /// Whether a heartbeat loop is running
    pub fn loop_active(&self) -> bool {
        self.txn_end.is_some()
    }

    pub fn final_err(&self) -> Option<&TxnError> {
        self.final_err.as_ref()
    }

    /// Signal the running loop, if any, to exit. Idempotent.
    pub fn close(&mut self) {
        if let Some(handle) = self.txn_end.take() {
            tracing::debug!(loop_id = handle.id, "closing heartbeat loop");
        }
    }

    /// Prepare for a new transaction attempt
    ///
    /// Closes any loop left over from the previous attempt and re-arms
    /// every flag.
    pub fn reset(&mut self) {
        self.close();
        self.need_begin_txn = true;
        self.final_err = None;
        self.attempt += 1;
    }

    fn is_current_loop(&self, attempt: u64, loop_id: u64) -> bool {
        self.attempt == attempt && self.txn_end.as_ref().map(|h| h.id) == Some(loop_id)
    }

    /// Record the exit of a loop
    ///
    /// A loop of an earlier attempt, or one that was replaced by a newer
    /// loop, leaves the state alone. A fatal error is never overwritten.
    fn finish_loop(&mut self, attempt: u64, loop_id: u64, err: TxnError) -> bool {
        if self.attempt != attempt {
            return false;
        }
        match &self.txn_end {
            Some(handle) if handle.id != loop_id => return false,
            Some(_) => self.txn_end = None,
            None => {}
        }
        if !self.final_err.as_ref().is_some_and(TxnError::is_fatal) {
            self.final_err = Some(err);
        }
        true
    }
}

impl Default for HeartbeatLocked {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Heartbeater
// =============================================================================

/// Interceptor that heartbeats a writing transaction's record
pub struct TxnHeartbeater {
    core: Arc<HeartbeaterCore>,
}

/// State shared by the interceptor and its background tasks
struct HeartbeaterCore {
    config: HeartbeaterConfig,
    deps: HeartbeaterDeps,
    wrapped: RwLock<Option<Arc<dyn LockedSender>>>,
}

/// What the loop should do after one heartbeat
#[derive(Debug)]
enum HeartbeatOutcome {
    Continue,
    /// The transaction is no longer pending
    Stop,
    /// The loop was closed while it was heartbeating
    Closed,
    /// Internal state is corrupt
    Fatal(TxnError),
}

impl TxnHeartbeater {
    /// Create a heartbeater for a new coordinator
    pub fn new(config: HeartbeaterConfig, deps: HeartbeaterDeps) -> pulse_core::Result<Self> {
        config.validate()?;
        Ok(Self {
            core: Arc::new(HeartbeaterCore {
                config,
                deps,
                wrapped: RwLock::new(None),
            }),
        })
    }

    /// Reconfigure a pooled heartbeater for a new transaction attempt
    ///
    /// `state` must be the state guarded by `deps.lock`. The wrapped sender
    /// carries over; every other setting is replaced. An invalid config
    /// leaves the heartbeater and `state` untouched.
    pub fn init(
        &mut self,
        config: HeartbeaterConfig,
        deps: HeartbeaterDeps,
        state: &mut TxnCoordState,
    ) -> pulse_core::Result<()> {
        config.validate()?;
        let wrapped = self.core.wrapped();
        self.core = Arc::new(HeartbeaterCore {
            config,
            deps,
            wrapped: RwLock::new(wrapped),
        });
        state.heartbeat.reset();
        tracing::debug!(txn_id = %state.txn.short_id(), "txn heartbeater initialized");
        Ok(())
    }

    /// Start the background heartbeat loop
    ///
    /// Starting a second loop while one runs is an invariant violation.
    pub fn start_heartbeat_loop_locked(&self, state: &mut TxnCoordState) -> Result<(), TxnError> {
        self.core.start_heartbeat_loop_locked(state)
    }
}

impl HeartbeaterCore {
    fn wrapped(&self) -> Option<Arc<dyn LockedSender>> {
        self.wrapped
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Anchor the transaction on its first write of the epoch
    ///
    /// Returns the position of the injected `BeginTransaction`, if any.
    fn prepare_first_write_locked(
        self: &Arc<Self>,
        state: &mut TxnCoordState,
        ba: &mut BatchRequest,
        first_write: usize,
    ) -> Result<Option<usize>, TxnError> {
        debug_assert!(first_write < ba.len());
        state.heartbeat.need_begin_txn = false;

        state.txn.writing = true;
        if state.txn.key.is_empty() {
            state.txn.key = ba.requests[first_write].key().clone();
        }
        if let Some(txn) = ba.txn.as_mut() {
            txn.writing = true;
            // The batch was built before the transaction had an anchor
            if txn.key.is_empty() {
                txn.key = state.txn.key.clone();
            }
        }

        let mut injected = None;
        if self.config.eager_record || !self.deps.settings.is_lazy_txn_record_active() {
            ba.requests.insert(
                first_write,
                Request::BeginTransaction {
                    key: state.txn.key.clone(),
                },
            );
            injected = Some(first_write);
        }

        // A batch ending the transaction has nothing left to keep alive
        if !state.heartbeat.loop_active() && !ba.has_end_transaction() {
            if let Err(err) = self.start_heartbeat_loop_locked(state) {
                tracing::debug!(txn_id = %state.txn.short_id(), error = %err, "failed to start heartbeat loop");
                state.heartbeat.final_err = Some(err.clone());
                return Err(err);
            }
        }
        Ok(injected)
    }

    fn start_heartbeat_loop_locked(self: &Arc<Self>, state: &mut TxnCoordState) -> Result<(), TxnError> {
        if state.heartbeat.txn_end.is_some() {
            tracing::error!(txn_id = %state.txn.short_id(), "attempting to start a second heartbeat loop");
            return Err(TxnError::invariant(format!(
                "heartbeat loop already running for txn {}",
                state.txn.short_id()
            )));
        }

        let (closer, txn_end) = oneshot::channel();
        let loop_id = state.heartbeat.next_loop_id;
        state.heartbeat.next_loop_id += 1;
        let attempt = state.heartbeat.attempt;
        state.heartbeat.txn_end = Some(LoopHandle {
            id: loop_id,
            _closer: closer,
        });

        // The loop outlives the request that started it
        let span = tracing::info_span!(
            parent: None,
            "heartbeat_loop",
            txn_id = %state.txn.short_id(),
            loop_id
        );
        span.follows_from(&tracing::Span::current());

        let core = Arc::clone(self);
        let spawned = self.deps.stopper.run_async_task(
            TASK_NAME_HEARTBEAT_LOOP,
            async move { core.heartbeat_loop(attempt, loop_id, txn_end).await }.instrument(span),
        );
        if let Err(err) = spawned {
            state.heartbeat.txn_end = None;
            return Err(err.into());
        }

        self.deps.metrics.record_loop_started();
        tracing::debug!(txn_id = %state.txn.short_id(), loop_id, "heartbeat loop started");
        Ok(())
    }

    async fn heartbeat_loop(
        self: Arc<Self>,
        attempt: u64,
        loop_id: u64,
        mut txn_end: oneshot::Receiver<()>,
    ) {
        let interval_ms = self.config.heartbeat_interval.as_millis() as u64;

        let final_err = loop {
            tokio::select! {
                _ = self.deps.clock.sleep_ms(interval_ms) => {
                    match self.heartbeat(attempt, loop_id).await {
                        HeartbeatOutcome::Continue => {}
                        HeartbeatOutcome::Stop => break TxnError::new(ErrorDetail::HeartbeatFailed),
                        HeartbeatOutcome::Closed => break TxnError::new(ErrorDetail::HeartbeaterClosed),
                        HeartbeatOutcome::Fatal(err) => break err,
                    }
                }
                _ = &mut txn_end => break TxnError::new(ErrorDetail::HeartbeaterClosed),
                _ = self.deps.stopper.quiesced() => break TxnError::new(ErrorDetail::NodeQuiescing),
            }
        };

        let mut guard = self.deps.lock.lock().await;
        let recorded = guard.heartbeat.finish_loop(attempt, loop_id, final_err.clone());
        tracing::debug!(reason = %final_err, recorded, "heartbeat loop exited");
    }

    /// Send one heartbeat and fold the result into the local record
    async fn heartbeat(&self, attempt: u64, loop_id: u64) -> HeartbeatOutcome {
        let guard = self.deps.lock.lock().await;

        if !guard.heartbeat.is_current_loop(attempt, loop_id) {
            return HeartbeatOutcome::Closed;
        }
        if guard.txn.status != TxnStatus::Pending {
            // Whoever finalized the txn should have closed the loop with it
            tracing::error!(txn = %guard.txn, "txn finalized but heartbeat loop was not signaled to stop");
            return HeartbeatOutcome::Fatal(TxnError::invariant(format!(
                "heartbeat loop still running for {} txn {}",
                guard.txn.status,
                guard.txn.short_id()
            )));
        }
        if guard.txn.key.is_empty() {
            tracing::error!(txn = %guard.txn, "heartbeat loop running without an anchor key");
            return HeartbeatOutcome::Fatal(TxnError::invariant(format!(
                "cannot heartbeat txn {} without an anchor key",
                guard.txn.short_id()
            )));
        }

        let txn = guard.txn.clone();
        let key = txn.key.clone();
        let now = Timestamp::from_millis(self.deps.clock.now_ms());
        let ba = BatchRequest::with_requests(Some(txn), vec![Request::HeartbeatTxn { key, now }]);

        self.deps.metrics.record_heartbeat_sent();
        tracing::trace!(%now, "sending heartbeat");
        let (mut guard, result) = self.deps.gatekeeper.send_locked(guard, ba).await;

        // A response for an earlier attempt says nothing about this one. A
        // loop closed during the round trip still folds its response in, so
        // an abort it observed is cleaned up.
        if guard.heartbeat.attempt != attempt {
            return HeartbeatOutcome::Closed;
        }

        let resp_txn = match result {
            Err(err) if err.is_txn_not_found() => {
                // A heartbeat can overtake the ambiguous write creating the record
                tracing::debug!(error = %err, "heartbeat found no txn record, will retry");
                self.deps.metrics.record_heartbeat_failure();
                return HeartbeatOutcome::Continue;
            }
            Err(err) if err.is_txn_aborted() => {
                tracing::info!(txn_id = %guard.txn.short_id(), "heartbeat detected aborted txn, cleaning up");
                self.deps.metrics.record_abort_detected();
                guard.txn.status = TxnStatus::Aborted;
                return match self.abort_txn_async_locked(&mut guard) {
                    Ok(()) => HeartbeatOutcome::Stop,
                    Err(err) => HeartbeatOutcome::Fatal(err),
                };
            }
            Err(err) => {
                tracing::debug!(error = %err, "heartbeat failed");
                self.deps.metrics.record_heartbeat_failure();
                err.txn
            }
            Ok(br) => match br.responses.into_iter().next() {
                Some(Response::HeartbeatTxn { txn }) => Some(txn),
                other => {
                    tracing::warn!(response = ?other.as_ref().map(Response::method), "unexpected heartbeat response");
                    br.txn
                }
            },
        };

        // Statuses may flip PENDING -> ABORTED -> COMMITTED when a heartbeat
        // races a commit; the merge keeps whichever final status came last.
        guard.txn.update(resp_txn.as_ref());
        if guard.txn.status != TxnStatus::Pending {
            if guard.txn.status == TxnStatus::Aborted {
                tracing::info!(txn_id = %guard.txn.short_id(), "heartbeat detected aborted txn, cleaning up");
                self.deps.metrics.record_abort_detected();
                if let Err(err) = self.abort_txn_async_locked(&mut guard) {
                    return HeartbeatOutcome::Fatal(err);
                }
            }
            return HeartbeatOutcome::Stop;
        }
        if !guard.heartbeat.is_current_loop(attempt, loop_id) {
            return HeartbeatOutcome::Closed;
        }
        HeartbeatOutcome::Continue
    }

    /// Notify the coordinator and roll back an aborted transaction
    ///
    /// The rollback goes through the wrapped sender so the interceptors
    /// below can attach the intents to resolve. It runs detached from every
    /// caller and is best-effort.
    fn abort_txn_async_locked(&self, state: &mut TxnCoordState) -> Result<(), TxnError> {
        if state.txn.status != TxnStatus::Aborted {
            tracing::error!(txn = %state.txn, "abort cleanup requested for txn that is not aborted");
            return Err(TxnError::invariant(format!(
                "cannot clean up {} txn {}",
                state.txn.status,
                state.txn.short_id()
            )));
        }

        (self.deps.on_async_abort)(state);

        let Some(wrapped) = self.wrapped() else {
            tracing::warn!(txn_id = %state.txn.short_id(), "no wrapped sender, skipping async abort");
            return Ok(());
        };

        let txn = state.txn.clone();
        let span = tracing::info_span!(parent: None, "async_abort", txn_id = %txn.short_id());
        let ba = BatchRequest::with_requests(
            Some(txn.clone()),
            vec![Request::EndTransaction {
                key: txn.key,
                commit: false,
                poison: true,
            }],
        );
        let lock = self.deps.lock.clone();
        let task = async move {
            let guard = lock.lock().await;
            let (_guard, result) = wrapped.send_locked(guard, ba).await;
            if let Err(err) = result {
                tracing::debug!(error = %err, "async abort failed");
            }
        }
        .instrument(span);

        match self.deps.stopper.run_async_task(TASK_NAME_ASYNC_ABORT, task) {
            Ok(()) => self.deps.metrics.record_async_abort(),
            Err(err) => {
                tracing::warn!(txn_id = %state.txn.short_id(), error = %err, "failed to schedule async abort")
            }
        }
        Ok(())
    }
}

/// Hide an injected `BeginTransaction` from the caller
///
/// The caller's batch never contained the marker, so its response slot is
/// removed and error indexes are shifted back onto the caller's requests.
fn strip_injected_begin(result: SendResult, injected: usize) -> SendResult {
    match result {
        Ok(mut br) => {
            let slot = br.responses.get(injected).map(Response::method);
            if slot == Some(Method::BeginTransaction) {
                br.responses.remove(injected);
            } else {
                tracing::warn!(index = injected, ?slot, "missing response for injected BeginTransaction");
            }
            Ok(br)
        }
        Err(mut err) => {
            err.index = match err.index {
                Some(i) if i == injected => None,
                Some(i) if i > injected => Some(i - 1),
                other => other,
            };
            Err(err)
        }
    }
}

#[async_trait]
impl LockedSender for TxnHeartbeater {
    async fn send_locked(&self, mut guard: TxnGuard, mut ba: BatchRequest) -> (TxnGuard, SendResult) {
        if let Some(err) = guard.heartbeat.final_err().cloned() {
            // Rollbacks still go out so the txn's intents get resolved
            if err.is_fatal() || !ba.is_single_rollback() {
                return (guard, Err(err));
            }
        }

        let first_write = match ba.first_write_index() {
            Ok(index) => index,
            Err(err) => return (guard, Err(err)),
        };

        let mut injected = None;
        if let Some(index) = first_write {
            if guard.heartbeat.need_begin_txn {
                match self.core.prepare_first_write_locked(&mut guard, &mut ba, index) {
                    Ok(marker) => injected = marker,
                    Err(err) => return (guard, Err(err)),
                }
            }
        }

        let Some(wrapped) = self.core.wrapped() else {
            return (guard, Err(TxnError::internal("txn heartbeater has no wrapped sender")));
        };
        let (guard, result) = wrapped.send_locked(guard, ba).await;

        match injected {
            Some(index) => (guard, strip_injected_begin(result, index)),
            None => (guard, result),
        }
    }
}

impl TxnInterceptor for TxnHeartbeater {
    fn set_wrapped(&self, wrapped: Arc<dyn LockedSender>) {
        *self
            .core
            .wrapped
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(wrapped);
    }

    fn populate_meta_locked(&self, _state: &TxnCoordState, _meta: &mut TxnCoordMeta) {}

    fn augment_meta_locked(&self, _state: &mut TxnCoordState, _meta: &TxnCoordMeta) {}

    fn epoch_bumped_locked(&self, state: &mut TxnCoordState) {
        state.heartbeat.need_begin_txn = true;
    }

    fn close_locked(&self, state: &mut TxnCoordState) {
        state.heartbeat.close();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BatchResponse, Key, Transaction};
    use pulse_core::WallClockTime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    type Responder = Box<dyn Fn(&BatchRequest) -> SendResult + Send + Sync>;

    /// Records every batch and answers with a configurable responder
    struct MockSender {
        batches: Mutex<Vec<BatchRequest>>,
        responder: Mutex<Responder>,
        /// Time the lock stays released per round trip
        latency: Mutex<Duration>,
    }

    impl MockSender {
        fn new() -> Arc<Self> {
            let responder: Responder = Box::new(|ba: &BatchRequest| Ok(ok_response(ba)));
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                responder: Mutex::new(responder),
                latency: Mutex::new(Duration::ZERO),
            })
        }

        fn set_latency(&self, latency: Duration) {
            *self.latency.lock().unwrap() = latency;
        }

        fn respond_with(&self, f: impl Fn(&BatchRequest) -> SendResult + Send + Sync + 'static) {
            *self.responder.lock().unwrap() = Box::new(f);
        }

        fn batches(&self) -> Vec<BatchRequest> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LockedSender for MockSender {
        async fn send_locked(&self, guard: TxnGuard, ba: BatchRequest) -> (TxnGuard, SendResult) {
            self.batches.lock().unwrap().push(ba.clone());
            let latency = *self.latency.lock().unwrap();
            let in_flight = async move {
                if latency.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(latency).await;
                }
            };
            let (guard, ()) = guard.unlocked(in_flight).await;
            let result = (*self.responder.lock().unwrap())(&ba);
            (guard, result)
        }
    }

    fn ok_response(ba: &BatchRequest) -> BatchResponse {
        let responses = ba
            .requests
            .iter()
            .map(|req| match req {
                Request::Get { .. } => Response::Get { value: None },
                Request::Scan { .. } => Response::Scan { rows: Vec::new() },
                Request::Put { .. } => Response::Put,
                Request::ConditionalPut { .. } => Response::ConditionalPut,
                Request::Delete { .. } => Response::Delete,
                Request::DeleteRange { .. } => Response::DeleteRange { keys: Vec::new() },
                Request::BeginTransaction { .. } => Response::BeginTransaction,
                Request::EndTransaction { .. } => Response::EndTransaction {
                    one_phase_commit: false,
                },
                Request::HeartbeatTxn { now, .. } => {
                    let mut txn = ba.txn.clone().unwrap();
                    txn.last_heartbeat.forward(*now);
                    Response::HeartbeatTxn { txn }
                }
            })
            .collect();
        BatchResponse::new(responses)
    }

    struct Harness {
        lock: TxnLock,
        hb: TxnHeartbeater,
        config: HeartbeaterConfig,
        deps: HeartbeaterDeps,
        wrapped: Arc<MockSender>,
        gatekeeper: Arc<MockSender>,
        stopper: Stopper,
        settings: Arc<ClusterSettings>,
        metrics: Arc<TxnMetrics>,
        aborts: Arc<AtomicUsize>,
    }

    fn harness(eager_record: bool) -> Harness {
        let txn = Transaction::new(Uuid::from_u128(42), "hb-test", Timestamp::from_millis(1));
        let lock = TxnLock::new(TxnCoordState::new(txn));
        let wrapped = MockSender::new();
        let gatekeeper = MockSender::new();
        let stopper = Stopper::new();
        let settings = Arc::new(ClusterSettings::new(true));
        let metrics = Arc::new(TxnMetrics::new());
        let aborts = Arc::new(AtomicUsize::new(0));

        let aborts_clone = aborts.clone();
        let deps = HeartbeaterDeps {
            lock: lock.clone(),
            gatekeeper: gatekeeper.clone(),
            clock: Arc::new(WallClockTime::new()),
            settings: settings.clone(),
            stopper: stopper.clone(),
            metrics: metrics.clone(),
            on_async_abort: Arc::new(move |_state: &mut TxnCoordState| {
                aborts_clone.fetch_add(1, Ordering::SeqCst);
            }),
        };
        let config = HeartbeaterConfig {
            heartbeat_interval: Duration::from_secs(1),
            eager_record,
        };
        let hb = TxnHeartbeater::new(config.clone(), deps.clone()).unwrap();
        hb.set_wrapped(wrapped.clone());

        Harness {
            lock,
            hb,
            config,
            deps,
            wrapped,
            gatekeeper,
            stopper,
            settings,
            metrics,
            aborts,
        }
    }

    fn batch(guard: &TxnGuard, requests: Vec<Request>) -> BatchRequest {
        BatchRequest::with_requests(Some(guard.txn.clone()), requests)
    }

    fn begin(key: &'static str) -> Request {
        Request::BeginTransaction {
            key: Key::from(key),
        }
    }

    /// Send a single put so the heartbeat loop starts
    async fn start_writing(h: &Harness) {
        let guard = h.lock.lock().await;
        let ba = batch(&guard, vec![Request::put("a", "1")]);
        let (guard, result) = h.hb.send_locked(guard, ba).await;
        result.unwrap();
        assert!(guard.heartbeat.loop_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eager_record_injects_begin_before_first_write() {
        let h = harness(true);
        let guard = h.lock.lock().await;

        let ba = batch(&guard, vec![Request::put("k1", "v1"), Request::put("k2", "v2")]);
        let (guard, result) = h.hb.send_locked(guard, ba).await;

        let br = result.unwrap();
        assert_eq!(br.responses, vec![Response::Put, Response::Put]);

        let sent = h.wrapped.batches();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].requests,
            vec![begin("k1"), Request::put("k1", "v1"), Request::put("k2", "v2")]
        );
        let sent_txn = sent[0].txn.as_ref().unwrap();
        assert!(sent_txn.writing);
        assert_eq!(sent_txn.key, Key::from("k1"));

        assert_eq!(guard.txn.key, Key::from("k1"));
        assert!(guard.txn.writing);
        assert!(!guard.heartbeat.need_begin_txn());
        assert!(guard.heartbeat.loop_active());
        assert_eq!(h.metrics.snapshot().heartbeat_loops_started, 1);

        drop(guard);
        h.stopper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_record_skips_begin() {
        let h = harness(false);
        let guard = h.lock.lock().await;

        let ba = batch(&guard, vec![Request::get("r"), Request::put("k1", "v1")]);
        let (guard, result) = h.hb.send_locked(guard, ba).await;

        assert_eq!(result.unwrap().responses.len(), 2);
        assert_eq!(
            h.wrapped.batches()[0].requests,
            vec![Request::get("r"), Request::put("k1", "v1")]
        );
        // Anchored and heartbeating even without the explicit begin
        assert_eq!(guard.txn.key, Key::from("k1"));
        assert!(guard.heartbeat.loop_active());

        drop(guard);
        h.stopper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_injected_when_lazy_record_inactive() {
        let h = harness(false);
        h.settings.set_lazy_txn_record_active(false);
        let guard = h.lock.lock().await;

        let ba = batch(&guard, vec![Request::get("r"), Request::delete("k1")]);
        let (guard, result) = h.hb.send_locked(guard, ba).await;

        let br = result.unwrap();
        assert_eq!(br.responses, vec![Response::Get { value: None }, Response::Delete]);
        assert_eq!(
            h.wrapped.batches()[0].requests,
            vec![Request::get("r"), begin("k1"), Request::delete("k1")]
        );

        drop(guard);
        h.stopper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_index_adjusted_for_injected_begin() {
        let h = harness(true);
        let cases = [(0, Some(0)), (1, None), (2, Some(1))];

        for (sent_index, expected_index) in cases {
            h.wrapped.respond_with(move |_| Err(TxnError::send_failed("boom").with_index(sent_index)));

            let mut guard = h.lock.lock().await;
            h.hb.epoch_bumped_locked(&mut guard);
            // Forwarded as [get, begin, put]
            let ba = batch(&guard, vec![Request::get("r"), Request::put("k1", "v1")]);
            let (_guard, result) = h.hb.send_locked(guard, ba).await;

            let err = result.unwrap_err();
            assert_eq!(err.index, expected_index, "sent index {}", sent_index);
        }

        h.stopper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_injected_once_per_epoch() {
        let h = harness(true);

        let guard = h.lock.lock().await;
        let ba = batch(&guard, vec![Request::put("k1", "v1")]);
        let (guard, result) = h.hb.send_locked(guard, ba).await;
        result.unwrap();

        let ba = batch(&guard, vec![Request::put("k2", "v2")]);
        let (guard, result) = h.hb.send_locked(guard, ba).await;
        assert_eq!(result.unwrap().responses, vec![Response::Put]);

        let sent = h.wrapped.batches();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].requests, vec![Request::put("k2", "v2")]);
        assert!(!guard.heartbeat.need_begin_txn());

        drop(guard);
        h.stopper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_epoch_bump_rearms_begin_with_same_anchor() {
        let h = harness(true);

        let mut guard = h.lock.lock().await;
        // Re-arming before any write is harmless
        h.hb.epoch_bumped_locked(&mut guard);
        assert!(guard.heartbeat.need_begin_txn());

        let ba = batch(&guard, vec![Request::put("k1", "v1")]);
        let (mut guard, result) = h.hb.send_locked(guard, ba).await;
        result.unwrap();
        assert!(!guard.heartbeat.need_begin_txn());

        guard.txn.bump_epoch();
        h.hb.epoch_bumped_locked(&mut guard);
        assert!(guard.heartbeat.need_begin_txn());

        let ba = batch(&guard, vec![Request::put("k9", "v9")]);
        let (guard, result) = h.hb.send_locked(guard, ba).await;
        result.unwrap();

        assert_eq!(
            h.wrapped.batches()[1].requests,
            vec![begin("k1"), Request::put("k9", "v9")]
        );
        // The existing loop keeps running; no second loop was started
        assert!(guard.heartbeat.loop_active());
        assert_eq!(h.metrics.snapshot().heartbeat_loops_started, 1);

        drop(guard);
        h.stopper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_sets_final_err_and_admits_rollback() {
        let h = harness(false);
        start_writing(&h).await;

        let mut guard = h.lock.lock().await;
        h.hb.close_locked(&mut guard);
        assert!(!guard.heartbeat.loop_active());
        // Closing twice is a no-op
        h.hb.close_locked(&mut guard);
        drop(guard);

        h.stopper.wait_idle().await;

        let guard = h.lock.lock().await;
        let final_err = guard.heartbeat.final_err().cloned().unwrap();
        assert_eq!(final_err.to_string(), "txn heartbeater already closed");

        let ba = batch(&guard, vec![Request::put("b", "2")]);
        let (guard, result) = h.hb.send_locked(guard, ba).await;
        assert_eq!(result.unwrap_err(), final_err);
        assert_eq!(h.wrapped.batches().len(), 1);

        let ba = batch(&guard, vec![Request::end_transaction("a", false)]);
        let (guard, result) = h.hb.send_locked(guard, ba).await;
        result.unwrap();
        assert_eq!(h.wrapped.batches().len(), 2);

        // A commit is not a rollback
        let ba = batch(&guard, vec![Request::end_transaction("a", true)]);
        let (_guard, result) = h.hb.send_locked(guard, ba).await;
        assert_eq!(result.unwrap_err(), final_err);
        assert_eq!(h.wrapped.batches().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_loop_start_is_invariant_violation() {
        let h = harness(false);
        start_writing(&h).await;

        let mut guard = h.lock.lock().await;
        let err = h.hb.start_heartbeat_loop_locked(&mut guard).unwrap_err();
        assert!(err.is_fatal());
        assert!(guard.heartbeat.loop_active());
        assert_eq!(h.metrics.snapshot().heartbeat_loops_started, 1);

        drop(guard);
        h.stopper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_heartbeat_triggers_cleanup() {
        let h = harness(false);
        h.gatekeeper.respond_with(|_| Err(TxnError::txn_aborted()));
        start_writing(&h).await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        h.stopper.wait_idle().await;

        let guard = h.lock.lock().await;
        assert_eq!(guard.txn.status, TxnStatus::Aborted);
        assert!(!guard.heartbeat.loop_active());
        assert_eq!(
            guard.heartbeat.final_err().map(|e| e.detail.clone()),
            Some(ErrorDetail::HeartbeatFailed)
        );
        assert_eq!(h.aborts.load(Ordering::SeqCst), 1);

        // Heartbeats go to the gatekeeper, the rollback through wrapped
        let gatekeeper_batches = h.gatekeeper.batches();
        assert_eq!(gatekeeper_batches.len(), 1);
        assert_eq!(gatekeeper_batches[0].requests[0].method(), Method::HeartbeatTxn);

        let wrapped_batches = h.wrapped.batches();
        assert_eq!(wrapped_batches.len(), 2);
        assert_eq!(
            wrapped_batches[1].requests,
            vec![Request::EndTransaction {
                key: Key::from("a"),
                commit: false,
                poison: true,
            }]
        );

        let snap = h.metrics.snapshot();
        assert_eq!(snap.aborts_detected, 1);
        assert_eq!(snap.async_aborts_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_record_in_response_triggers_cleanup() {
        let h = harness(false);
        h.gatekeeper.respond_with(|ba| {
            let mut txn = ba.txn.clone().unwrap();
            txn.status = TxnStatus::Aborted;
            Ok(BatchResponse::new(vec![Response::HeartbeatTxn { txn }]))
        });
        start_writing(&h).await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        h.stopper.wait_idle().await;

        let guard = h.lock.lock().await;
        assert_eq!(guard.txn.status, TxnStatus::Aborted);
        assert_eq!(h.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(h.wrapped.batches().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_txn_not_found_keeps_heartbeating() {
        let h = harness(false);
        h.gatekeeper.respond_with(|_| Err(TxnError::txn_not_found("no record")));
        start_writing(&h).await;

        tokio::time::sleep(Duration::from_millis(3500)).await;

        let guard = h.lock.lock().await;
        assert!(guard.heartbeat.loop_active());
        assert!(guard.heartbeat.final_err().is_none());
        assert_eq!(guard.txn.status, TxnStatus::Pending);
        assert_eq!(h.gatekeeper.batches().len(), 3);
        assert_eq!(h.metrics.snapshot().heartbeat_failures, 3);
        assert_eq!(h.aborts.load(Ordering::SeqCst), 0);

        drop(guard);
        h.stopper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_heartbeats_advance_last_heartbeat() {
        let h = harness(false);
        start_writing(&h).await;

        tokio::time::sleep(Duration::from_millis(2500)).await;

        let guard = h.lock.lock().await;
        assert_eq!(h.gatekeeper.batches().len(), 2);
        assert!(!guard.txn.last_heartbeat.is_empty());
        assert_eq!(h.metrics.snapshot().heartbeats_sent, 2);

        drop(guard);
        h.stopper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_committed_heartbeat_response_stops_loop() {
        let h = harness(false);
        h.gatekeeper.respond_with(|ba| {
            let mut txn = ba.txn.clone().unwrap();
            txn.status = TxnStatus::Committed;
            Ok(BatchResponse::new(vec![Response::HeartbeatTxn { txn }]))
        });
        start_writing(&h).await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        h.stopper.wait_idle().await;

        let guard = h.lock.lock().await;
        assert_eq!(guard.txn.status, TxnStatus::Committed);
        assert!(!guard.heartbeat.loop_active());
        assert_eq!(
            guard.heartbeat.final_err().map(|e| e.detail.clone()),
            Some(ErrorDetail::HeartbeatFailed)
        );
        assert_eq!(h.aborts.load(Ordering::SeqCst), 0);
        assert_eq!(h.wrapped.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_only_batch_forwarded_unchanged() {
        let h = harness(true);
        let guard = h.lock.lock().await;

        let ba = batch(&guard, vec![Request::end_transaction("", true)]);
        let (guard, result) = h.hb.send_locked(guard, ba.clone()).await;

        result.unwrap();
        assert_eq!(h.wrapped.batches(), vec![ba]);
        assert!(guard.heartbeat.need_begin_txn());
        assert!(!guard.heartbeat.loop_active());
        assert_eq!(h.stopper.task_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_terminal_end_transaction_rejected() {
        let h = harness(true);
        let guard = h.lock.lock().await;

        let ba = batch(
            &guard,
            vec![Request::end_transaction("k1", true), Request::put("k1", "v1")],
        );
        let (guard, result) = h.hb.send_locked(guard, ba).await;

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "EndTransaction sent as non-terminal call");
        assert!(h.wrapped.batches().is_empty());
        assert!(guard.heartbeat.need_begin_txn());
        assert!(guard.heartbeat.final_err().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_phase_commit_batch_starts_no_loop() {
        let h = harness(true);
        let guard = h.lock.lock().await;

        let ba = batch(
            &guard,
            vec![Request::put("k1", "v1"), Request::end_transaction("k1", true)],
        );
        let (guard, result) = h.hb.send_locked(guard, ba).await;

        assert_eq!(
            result.unwrap().responses,
            vec![
                Response::Put,
                Response::EndTransaction {
                    one_phase_commit: false
                }
            ]
        );
        assert_eq!(
            h.wrapped.batches()[0].requests,
            vec![
                begin("k1"),
                Request::put("k1", "v1"),
                Request::end_transaction("k1", true)
            ]
        );
        assert!(!guard.heartbeat.loop_active());
        assert_eq!(h.stopper.task_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiesce_stops_loop() {
        let h = harness(false);
        start_writing(&h).await;

        h.stopper.stop().await;

        let guard = h.lock.lock().await;
        assert!(!guard.heartbeat.loop_active());
        assert_eq!(
            guard.heartbeat.final_err().map(|e| e.detail.clone()),
            Some(ErrorDetail::NodeQuiescing)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_start_failure_rejects_batch() {
        let h = harness(false);
        h.stopper.quiesce();

        let guard = h.lock.lock().await;
        let ba = batch(&guard, vec![Request::put("k1", "v1")]);
        let (guard, result) = h.hb.send_locked(guard, ba).await;

        let err = result.unwrap_err();
        assert!(matches!(err.detail, ErrorDetail::TaskRejected { .. }));
        assert!(!err.is_fatal());
        assert!(h.wrapped.batches().is_empty());
        assert!(!guard.heartbeat.loop_active());
        assert_eq!(guard.heartbeat.final_err(), Some(&err));
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_resets_state_and_ignores_stale_loop() {
        let mut h = harness(false);
        start_writing(&h).await;

        let mut guard = h.lock.lock().await;
        h.hb.init(h.config.clone(), h.deps.clone(), &mut guard).unwrap();
        assert!(guard.heartbeat.need_begin_txn());
        assert!(!guard.heartbeat.loop_active());
        assert!(guard.heartbeat.final_err().is_none());
        drop(guard);

        // The old loop exits without touching the new attempt's state
        h.stopper.wait_idle().await;
        let guard = h.lock.lock().await;
        assert!(guard.heartbeat.final_err().is_none());

        // The wrapped sender survived init
        let ba = batch(&guard, vec![Request::put("k2", "v2")]);
        let (guard, result) = h.hb.send_locked(guard, ba).await;
        result.unwrap();
        assert!(guard.heartbeat.loop_active());
        assert_eq!(h.wrapped.batches().len(), 2);

        drop(guard);
        h.stopper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_without_anchor_is_fatal() {
        let h = harness(false);

        let mut guard = h.lock.lock().await;
        h.hb.start_heartbeat_loop_locked(&mut guard).unwrap();
        drop(guard);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        h.stopper.wait_idle().await;

        let guard = h.lock.lock().await;
        assert!(!guard.heartbeat.loop_active());
        assert!(guard.heartbeat.final_err().unwrap().is_fatal());
        assert!(h.gatekeeper.batches().is_empty());

        // Fatal errors block rollbacks too
        let ba = batch(&guard, vec![Request::end_transaction("k1", false)]);
        let (_guard, result) = h.hb.send_locked(guard, ba).await;
        assert!(result.unwrap_err().is_fatal());
        assert!(h.wrapped.batches().is_empty());
    }

    #[tokio::test]
    async fn test_send_without_wrapped_sender() {
        let h = harness(false);
        let hb = TxnHeartbeater::new(h.config.clone(), h.deps.clone()).unwrap();

        let guard = h.lock.lock().await;
        let ba = batch(&guard, vec![Request::get("k1")]);
        let (_guard, result) = hb.send_locked(guard, ba).await;

        let err = result.unwrap_err();
        assert!(matches!(err.detail, ErrorDetail::Internal { .. }));
    }

    fn aborted_heartbeat_response(ba: &BatchRequest) -> SendResult {
        let mut txn = ba.txn.clone().unwrap();
        txn.status = TxnStatus::Aborted;
        Ok(BatchResponse::new(vec![Response::HeartbeatTxn { txn }]))
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_seen_by_heartbeat_in_flight_at_close_is_cleaned_up() {
        let h = harness(false);
        h.gatekeeper.set_latency(Duration::from_millis(500));
        h.gatekeeper.respond_with(aborted_heartbeat_response);
        start_writing(&h).await;

        // The first heartbeat leaves at 1s and lands at 1.5s
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let mut guard = h.lock.lock().await;
        assert_eq!(h.gatekeeper.batches().len(), 1);
        h.hb.close_locked(&mut guard);
        drop(guard);

        h.stopper.wait_idle().await;

        let guard = h.lock.lock().await;
        assert_eq!(guard.txn.status, TxnStatus::Aborted);
        assert!(!guard.heartbeat.loop_active());
        assert_eq!(h.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(h.gatekeeper.batches().len(), 1);

        let wrapped_batches = h.wrapped.batches();
        assert_eq!(wrapped_batches.len(), 2);
        assert!(wrapped_batches[1].is_single_rollback());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_in_flight_at_init_is_ignored() {
        let mut h = harness(false);
        h.gatekeeper.set_latency(Duration::from_millis(500));
        h.gatekeeper.respond_with(aborted_heartbeat_response);
        start_writing(&h).await;

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let mut guard = h.lock.lock().await;
        h.hb.init(h.config.clone(), h.deps.clone(), &mut guard).unwrap();
        drop(guard);

        h.stopper.wait_idle().await;

        // The response belongs to the previous attempt
        let guard = h.lock.lock().await;
        assert_eq!(guard.txn.status, TxnStatus::Pending);
        assert!(guard.heartbeat.final_err().is_none());
        assert_eq!(h.aborts.load(Ordering::SeqCst), 0);
        assert_eq!(h.wrapped.batches().len(), 1);
    }

    #[test]
    fn test_heartbeat_interval_limits() {
        let at = |ms| HeartbeaterConfig {
            heartbeat_interval: Duration::from_millis(ms),
            eager_record: false,
        };
        assert!(at(HEARTBEAT_INTERVAL_MS_MIN).validate().is_ok());
        assert!(at(HEARTBEAT_INTERVAL_MS_MAX).validate().is_ok());
        assert!(at(0).validate().is_err());
        assert!(at(HEARTBEAT_INTERVAL_MS_MIN - 1).validate().is_err());
        assert!(at(HEARTBEAT_INTERVAL_MS_MAX + 1).validate().is_err());
        assert!(HeartbeaterConfig::default().validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_heartbeat_interval_rejected() {
        let mut h = harness(false);
        let zero = HeartbeaterConfig {
            heartbeat_interval: Duration::ZERO,
            eager_record: false,
        };

        let err = TxnHeartbeater::new(zero.clone(), h.deps.clone()).err().unwrap();
        assert!(matches!(err, pulse_core::Error::InvalidConfiguration { .. }));

        start_writing(&h).await;
        let mut guard = h.lock.lock().await;
        let err = h.hb.init(zero, h.deps.clone(), &mut guard).unwrap_err();
        assert!(matches!(err, pulse_core::Error::InvalidConfiguration { .. }));
        // A rejected init leaves the running attempt alone
        assert!(guard.heartbeat.loop_active());
        assert!(!guard.heartbeat.need_begin_txn());
        drop(guard);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(h.gatekeeper.batches().len(), 2);

        h.stopper.stop().await;
    }

    #[test]
    fn test_config_from_txn_config() {
        let config = HeartbeaterConfig::from(&TxnConfig {
            heartbeat_interval_ms: 250,
            eager_record: true,
        });
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert!(config.eager_record);
    }
}
