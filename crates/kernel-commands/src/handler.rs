//! The single-handler-per-request contract.

use async_trait::async_trait;
use kernel_core::KernelResult;
use tokio_util::sync::CancellationToken;

use crate::request::Request;

/// Handles exactly one request type, returning its declared response type.
#[async_trait]
pub trait CommandHandler<R: Request>: Send + Sync {
    async fn handle(&self, request: R, cancel: CancellationToken) -> KernelResult<R::Response>;
}
