//! Observable snapshot of a live or recently completed task.

use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kernel_core::{ExtensionId, TaskId};
use serde::{Deserialize, Serialize};

/// The task state machine.
///
/// ```text
/// Pending ──► Processing ──► Completed
///                       ├──► Failed       (after exhausting retries)
///                       └──► Cancelled    (external cancellation signal)
/// ```
/// Retries within `Processing` are internal to the worker: status does not
/// revert to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// `GetActiveTasks` only ever returns `Pending` or `Processing` states.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Processing)
    }

    /// `Completed`, `Failed`, and `Cancelled` are terminal: the state store's
    /// GC sweep only ever removes entries in one of these.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Observable snapshot of a task.
#[derive(Clone)]
pub struct TaskState {
    pub task_id: TaskId,
    pub extension_id: Option<ExtensionId>,
    pub task_type: String,
    pub status: TaskStatus,
    /// `0..=100`, absent if the subscription has no step plan.
    pub progress: Option<u8>,
    /// 1-based; absent if the subscription has no step plan.
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// The originally published value, kept for typed `OnChange<T>` observers.
    pub task_data: Arc<dyn Any + Send + Sync>,
}

impl std::fmt::Debug for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskState")
            .field("task_id", &self.task_id)
            .field("extension_id", &self.extension_id)
            .field("task_type", &self.task_type)
            .field("status", &self.status)
            .field("progress", &self.progress)
            .field("current_step", &self.current_step)
            .field("total_steps", &self.total_steps)
            .field("message", &self.message)
            .field("created_at", &self.created_at)
            .field("started_at", &self.started_at)
            .field("completed_at", &self.completed_at)
            .finish()
    }
}

impl TaskState {
    /// `Duration = (CompletedAt ?? now) − StartedAt`, absent if `StartedAt`
    /// is not yet set.
    pub fn duration(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or(now);
        Some(end - started)
    }

    /// Down-convert `task_data` to a concrete `T`, for typed `OnChange<T>`
    /// observers.
    pub fn task_data_as<T: 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.task_data).downcast::<T>().ok()
    }
}
