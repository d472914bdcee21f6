//! Simulated transaction coordinator
//!
//! A minimal coordinator that drives one transaction through a heartbeater
//! wired to a [`SimCluster`]: the heartbeater wraps the cluster's wrapped
//! sender and heartbeats through its gatekeeper. After each batch it folds
//! the returned transaction into its own copy and closes the heartbeater
//! once the transaction is finalized, as a real coordinator does.

use crate::cluster::SimCluster;
use pulse_core::{ClusterSettings, Stopper, TimeProvider};
use pulse_txn::{
    BatchRequest, ErrorDetail, HeartbeaterConfig, HeartbeaterDeps, LockedSender, Request,
    SendResult, Transaction, TransactionStatusReason, TxnCoordState, TxnError, TxnHeartbeater,
    TxnInterceptor, TxnLock, TxnMetrics, TxnStatus,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Drives a single transaction against the simulated cluster
pub struct SimCoordinator {
    lock: TxnLock,
    heartbeater: TxnHeartbeater,
    /// Times the heartbeater reported an async abort
    async_aborts: Arc<AtomicUsize>,
}

impl SimCoordinator {
    pub fn new(
        txn: Transaction,
        config: HeartbeaterConfig,
        cluster: &Arc<SimCluster>,
        clock: Arc<dyn TimeProvider>,
        settings: Arc<ClusterSettings>,
        stopper: Stopper,
        metrics: Arc<TxnMetrics>,
    ) -> pulse_core::Result<Self> {
        let lock = TxnLock::new(TxnCoordState::new(txn));
        let async_aborts = Arc::new(AtomicUsize::new(0));

        let aborts = async_aborts.clone();
        let deps = HeartbeaterDeps {
            lock: lock.clone(),
            gatekeeper: cluster.gatekeeper(),
            clock,
            settings,
            stopper,
            metrics,
            on_async_abort: Arc::new(move |state: &mut TxnCoordState| {
                aborts.fetch_add(1, Ordering::SeqCst);
                tracing::info!(txn_id = %state.txn.short_id(), "coordinator notified of async abort");
            }),
        };
        let heartbeater = TxnHeartbeater::new(config, deps)?;
        heartbeater.set_wrapped(cluster.wrapped());

        Ok(Self {
            lock,
            heartbeater,
            async_aborts,
        })
    }

    /// Send a batch on behalf of the transaction
    pub async fn send(&self, requests: Vec<Request>) -> SendResult {
        let guard = self.lock.lock().await;
        let ba = BatchRequest::with_requests(Some(guard.txn.clone()), requests);

        // A finalized transaction only accepts rollbacks, which resolve intents
        if guard.txn.status.is_finalized() && !ba.is_single_rollback() {
            let err = match guard.txn.status {
                TxnStatus::Aborted => TxnError::txn_aborted(),
                _ => TxnError::new(ErrorDetail::TransactionStatus {
                    reason: TransactionStatusReason::TxnFinalized,
                    message: format!("txn already {}", guard.txn.status),
                }),
            };
            return Err(err.with_txn(guard.txn.clone()));
        }

        let (mut guard, result) = self.heartbeater.send_locked(guard, ba).await;
        match &result {
            Ok(br) => guard.txn.update(br.txn.as_ref()),
            Err(err) => guard.txn.update(err.txn.as_ref()),
        }
        if guard.txn.status.is_finalized() {
            self.heartbeater.close_locked(&mut guard);
        }
        result
    }

    pub async fn put(&self, key: &'static str, value: &'static str) -> SendResult {
        self.send(vec![Request::put(key, value)]).await
    }

    pub async fn get(&self, key: &'static str) -> SendResult {
        self.send(vec![Request::get(key)]).await
    }

    /// Commit; the anchor key addresses the record
    pub async fn commit(&self) -> SendResult {
        let key = self.lock.lock().await.txn.key.clone();
        self.send(vec![Request::EndTransaction {
            key,
            commit: true,
            poison: false,
        }])
        .await
    }

    pub async fn rollback(&self) -> SendResult {
        let key = self.lock.lock().await.txn.key.clone();
        self.send(vec![Request::EndTransaction {
            key,
            commit: false,
            poison: false,
        }])
        .await
    }

    /// Restart the transaction at the next epoch
    pub async fn restart(&self) {
        let mut guard = self.lock.lock().await;
        guard.txn.bump_epoch();
        self.heartbeater.epoch_bumped_locked(&mut guard);
    }

    /// Stop heartbeating without finishing the transaction
    pub async fn close(&self) {
        let mut guard = self.lock.lock().await;
        self.heartbeater.close_locked(&mut guard);
    }

    /// Coordinator's copy of the transaction
    pub async fn txn(&self) -> Transaction {
        self.lock.lock().await.txn.clone()
    }

    pub async fn loop_active(&self) -> bool {
        self.lock.lock().await.heartbeat.loop_active()
    }

    /// The heartbeater's terminal error, if any
    pub async fn final_err(&self) -> Option<TxnError> {
        self.lock.lock().await.heartbeat.final_err().cloned()
    }

    pub fn async_aborts(&self) -> usize {
        self.async_aborts.load(Ordering::SeqCst)
    }
}
