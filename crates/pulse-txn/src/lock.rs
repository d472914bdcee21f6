//! The coordinator lock
//!
//! One async mutex guards a coordinator's whole transaction state: the
//! transaction record mirror plus every interceptor's bookkeeping. Callers
//! hand the held lock down the sender stack as a `TxnGuard`. A sender that
//! blocks on the network gives the lock up for the duration with
//! [`TxnGuard::unlocked`] and hands the reacquired guard back, so holding
//! the guard across `send_locked` does not mean holding it for the round trip.

use crate::api::Transaction;
use crate::heartbeater::HeartbeatLocked;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// State protected by the coordinator lock
#[derive(Debug)]
pub struct TxnCoordState {
    /// The coordinator's mirror of the transaction record
    pub txn: Transaction,
    /// Heartbeater bookkeeping
    pub heartbeat: HeartbeatLocked,
}

impl TxnCoordState {
    pub fn new(txn: Transaction) -> Self {
        Self {
            txn,
            heartbeat: HeartbeatLocked::new(),
        }
    }
}

/// Shared handle to a coordinator's lock
#[derive(Debug, Clone)]
pub struct TxnLock {
    inner: Arc<Mutex<TxnCoordState>>,
}

impl TxnLock {
    pub fn new(state: TxnCoordState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Acquire the lock
    pub async fn lock(&self) -> TxnGuard {
        TxnGuard {
            guard: self.inner.clone().lock_owned().await,
            lock: self.clone(),
        }
    }

    /// Whether both handles refer to the same lock
    pub fn same_lock(&self, other: &TxnLock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Proof that the coordinator lock is held
///
/// Owned so it can be passed down the sender stack and back.
#[derive(Debug)]
pub struct TxnGuard {
    guard: OwnedMutexGuard<TxnCoordState>,
    lock: TxnLock,
}

impl TxnGuard {
    /// The lock this guard holds
    pub fn lock_handle(&self) -> &TxnLock {
        &self.lock
    }

    /// Release the lock while `future` runs, then reacquire it
    ///
    /// State read before this call may be stale afterwards.
    pub async fn unlocked<F>(self, future: F) -> (TxnGuard, F::Output)
    where
        F: Future,
    {
        let TxnGuard { guard, lock } = self;
        drop(guard);
        let output = future.await;
        (lock.lock().await, output)
    }
}

impl Deref for TxnGuard {
    type Target = TxnCoordState;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for TxnGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
