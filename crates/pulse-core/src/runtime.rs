//! Runtime abstraction
//!
//! TigerStyle: Explicit runtime abstraction so task spawning can be swapped
//! out under simulation.
//!
//! ```text
//! Production:          Testing:
//! TokioRuntime -----> Runtime <----- paused tokio runtime (pulse-dst)
//!     (wall clock)    (trait)        (virtual time)
//! ```

use std::future::Future;
use std::pin::Pin;

/// JoinHandle for spawned tasks
///
/// Dropping the handle detaches the task; it keeps running.
pub type JoinHandle<T> = Pin<Box<dyn Future<Output = Result<T, JoinError>> + Send>>;

/// Error from joining a task
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("task panicked")]
    Panicked,
    #[error("task cancelled")]
    Cancelled,
}

/// Runtime abstraction trait
///
/// Note: This trait is NOT dyn-safe due to spawn's generic parameter.
pub trait Runtime: Send + Sync + Clone {
    /// Spawn a new task
    ///
    /// The task runs concurrently with the current task and is not tied to
    /// the lifetime of the caller.
    fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static;
}

/// Production runtime using tokio
#[derive(Debug, Clone, Default)]
pub struct TokioRuntime;

impl Runtime for TokioRuntime {
    fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = tokio::spawn(future);
        Box::pin(async move {
            handle.await.map_err(|e| {
                if e.is_panic() {
                    JoinError::Panicked
                } else {
                    JoinError::Cancelled
                }
            })
        })
    }
}

/// Type alias for the current runtime
pub type CurrentRuntime = TokioRuntime;

/// Get the current runtime instance
pub fn current_runtime() -> CurrentRuntime {
    TokioRuntime
}
