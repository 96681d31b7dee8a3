//! Task handler contract and the payload handed to it (`spec.md` §4.F, §6).

use std::sync::Arc;

use async_trait::async_trait;
use kernel_core::{ExtensionId, KernelResult, TaskId};
use tokio_util::sync::CancellationToken;

use crate::progress::ProgressContext;

/// Everything a task handler receives for one attempt at processing a task.
pub struct TaskPayload<T> {
    pub data: T,
    pub task_id: TaskId,
    pub extension_id: Option<ExtensionId>,
    pub progress: Arc<ProgressContext>,
    pub cancel: CancellationToken,
}

/// Handles one task of type `T`. Unlike commands, exactly one subscription
/// processes each routing key, but (unlike events) a task is delivered to
/// only that one subscription's worker pool — there is no fan-out.
#[async_trait]
pub trait TaskHandler<T>: Send + Sync {
    async fn handle(&self, payload: TaskPayload<T>) -> KernelResult<()>;
}
