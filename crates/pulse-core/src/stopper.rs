//! Async task scheduling with cooperative shutdown
//!
//! TigerStyle: Explicit task lifecycle, graceful shutdown via channel.
//!
//! A `Stopper` owns every background task a node starts. Once `quiesce()`
//! is called, new tasks are refused and running tasks observe the signal
//! through `quiesced()` and wind down on their own.

use crate::error::{Error, Result};
use crate::runtime::{current_runtime, Runtime};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Task scheduler and quiescence signal shared by a node's components
#[derive(Debug, Clone)]
pub struct Stopper {
    inner: Arc<StopperInner>,
}

#[derive(Debug)]
struct StopperInner {
    /// Flips to true once, when the node starts shutting down
    quiesce_tx: watch::Sender<bool>,
    /// Number of tasks started through this stopper that are still running
    tasks_tx: watch::Sender<usize>,
}

/// Decrements the running task count when the task finishes or unwinds
struct TaskGuard {
    inner: Arc<StopperInner>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.inner.tasks_tx.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl Default for Stopper {
    fn default() -> Self {
        Self::new()
    }
}

impl Stopper {
    /// Create a new stopper
    pub fn new() -> Self {
        let (quiesce_tx, _) = watch::channel(false);
        let (tasks_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(StopperInner {
                quiesce_tx,
                tasks_tx,
            }),
        }
    }

    /// Run `future` as a detached background task
    ///
    /// The task is not cancelled when the caller goes away. Fails only if the
    /// stopper has started quiescing.
    pub fn run_async_task<F>(&self, name: &str, future: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Count first, then check: stop() must never observe zero tasks while
        // one is being admitted.
        self.inner.tasks_tx.send_modify(|n| *n += 1);
        let guard = TaskGuard {
            inner: self.inner.clone(),
        };

        if self.is_quiescing() {
            drop(guard);
            return Err(Error::quiescing(name));
        }

        tracing::trace!(task = name, "spawning async task");
        let _detached = current_runtime().spawn(async move {
            let _guard = guard;
            future.await;
        });
        Ok(())
    }

    /// Begin quiescing: refuse new tasks and signal running ones
    pub fn quiesce(&self) {
        let was_quiescing = self.inner.quiesce_tx.send_replace(true);
        if !was_quiescing {
            tracing::info!(tasks = self.task_count(), "stopper quiescing");
        }
    }

    /// Whether quiescing has started
    pub fn is_quiescing(&self) -> bool {
        *self.inner.quiesce_tx.borrow()
    }

    /// Resolve once quiescing has started
    pub async fn quiesced(&self) {
        let mut rx = self.inner.quiesce_tx.subscribe();
        // The sender lives as long as `self`, so this only returns on quiesce.
        let _ = rx.wait_for(|quiescing| *quiescing).await;
    }

    /// Number of running tasks
    pub fn task_count(&self) -> usize {
        *self.inner.tasks_tx.borrow()
    }

    /// Quiesce and wait for every running task to finish
    pub async fn stop(&self) {
        self.quiesce();
        self.wait_idle().await;
    }

    /// Wait until no task is running, without quiescing
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.tasks_tx.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}
