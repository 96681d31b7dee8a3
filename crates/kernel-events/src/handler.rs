//! Event handler contract.

use async_trait::async_trait;
use kernel_core::KernelResult;
use tokio_util::sync::CancellationToken;

/// Handles one event of type `E`. Unlike commands, any number of handlers
/// (subscriptions) may exist for the same event type.
#[async_trait]
pub trait EventHandler<E>: Send + Sync {
    async fn handle(&self, event: E, cancel: CancellationToken) -> KernelResult<()>;
}
