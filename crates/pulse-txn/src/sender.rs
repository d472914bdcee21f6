//! Sender traits for the coordinator's interceptor stack
//!
//! TigerStyle: The lock travels with the request.
//!
//! Every sender receives the held coordinator lock along with the batch and
//! returns it along with the result. Senders that wait on the network
//! release it in between via [`TxnGuard::unlocked`].

use crate::api::{BatchRequest, BatchResponse, TxnCoordMeta};
use crate::error::TxnError;
use crate::lock::{TxnCoordState, TxnGuard};
use async_trait::async_trait;
use std::sync::Arc;

/// Result of sending a batch
pub type SendResult = Result<BatchResponse, TxnError>;

/// Something that sends batches with the coordinator lock held
#[async_trait]
pub trait LockedSender: Send + Sync {
    /// Send a batch; the returned guard holds the same lock as `guard`
    async fn send_locked(&self, guard: TxnGuard, ba: BatchRequest) -> (TxnGuard, SendResult);
}

/// A link in the coordinator's interceptor chain
///
/// All `*_locked` methods are called with the coordinator lock held.
pub trait TxnInterceptor: LockedSender {
    /// Set the next sender in the chain
    fn set_wrapped(&self, wrapped: Arc<dyn LockedSender>);

    /// Export interceptor state into coordinator metadata
    fn populate_meta_locked(&self, state: &TxnCoordState, meta: &mut TxnCoordMeta);

    /// Import coordinator metadata produced elsewhere
    fn augment_meta_locked(&self, state: &mut TxnCoordState, meta: &TxnCoordMeta);

    /// The transaction restarted at a higher epoch
    fn epoch_bumped_locked(&self, state: &mut TxnCoordState);

    /// The coordinator is done with the transaction; stop background work
    fn close_locked(&self, state: &mut TxnCoordState);
}
