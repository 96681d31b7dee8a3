//! Registry of live `TaskState`s and the pub/sub for state-change observers
//! filtered by task type, extension id, or both.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kernel_core::{Clock, ExtensionId, TaskId};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::state::{TaskState, TaskStatus};

type Observer = Arc<dyn Fn(&TaskState) + Send + Sync>;

/// A handle returned by one of `TaskStateStore`'s `on_change*` methods.
/// Cancelling it removes the observer; dropping it without cancelling
/// leaves the observer registered (the store owns the subscription, not
/// the handle).
pub struct StateChangeHandle {
    id: Uuid,
    remove: Box<dyn Fn(Uuid) + Send + Sync>,
}

impl std::fmt::Debug for StateChangeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateChangeHandle").field("id", &self.id).finish()
    }
}

impl StateChangeHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel(&self) {
        (self.remove)(self.id);
    }
}

/// The registry of live `TaskState`s plus the four observer dimensions:
/// global, by `ExtensionId`, by task type, and by (task type, `ExtensionId`).
pub struct TaskStateStore {
    states: DashMap<TaskId, TaskState>,
    global: DashMap<Uuid, Observer>,
    by_extension: DashMap<Uuid, (ExtensionId, Observer)>,
    by_type: DashMap<Uuid, (String, Observer)>,
    by_type_and_extension: DashMap<Uuid, (String, ExtensionId, Observer)>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl std::fmt::Debug for TaskStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStateStore")
            .field("tracked_tasks", &self.states.len())
            .field("global_observers", &self.global.len())
            .finish()
    }
}

impl TaskStateStore {
    pub fn new(clock: Arc<dyn Clock>, retention: Duration) -> Arc<Self> {
        Arc::new(TaskStateStore {
            states: DashMap::new(),
            global: DashMap::new(),
            by_extension: DashMap::new(),
            by_type: DashMap::new(),
            by_type_and_extension: DashMap::new(),
            clock,
            retention,
        })
    }

    /// Create a fresh `TaskState(Pending)` and notify matching observers.
    pub fn create(
        &self,
        task_id: TaskId,
        task_type: impl Into<String>,
        extension_id: Option<ExtensionId>,
        task_data: Arc<dyn std::any::Any + Send + Sync>,
    ) {
        let task_type = task_type.into();
        let state = TaskState {
            task_id,
            extension_id: extension_id.clone(),
            task_type: task_type.clone(),
            status: TaskStatus::Pending,
            progress: None,
            current_step: None,
            total_steps: None,
            message: None,
            created_at: self.clock.now(),
            started_at: None,
            completed_at: None,
            task_data,
        };
        self.states.insert(task_id, state.clone());
        self.notify(&state);
    }

    /// `StartTask`: `Pending -> Processing`, `StartedAt = now`.
    pub fn start_task(&self, task_id: TaskId) {
        self.mutate_and_notify(task_id, |state| {
            state.status = TaskStatus::Processing;
            state.started_at = Some(self.clock.now());
        });
    }

    /// `UpdateProgress(id, p, step?, msg?)`: mutates in place; notifies only
    /// if `(p, step, msg)` actually changed.
    pub fn update_progress(
        &self,
        task_id: TaskId,
        percent: u8,
        current_step: Option<u32>,
        total_steps: Option<u32>,
        message: Option<String>,
    ) {
        let mut changed = false;
        self.mutate_and_notify_if(task_id, |state| {
            if state.progress != Some(percent)
                || state.current_step != current_step
                || state.message != message
            {
                state.progress = Some(percent);
                state.current_step = current_step;
                state.total_steps = total_steps;
                state.message = message.clone();
                changed = true;
            }
            changed
        });
    }

    /// `CompleteTask`: `-> Completed`, `Progress = 100`, `CompletedAt = now`.
    pub fn complete_task(&self, task_id: TaskId) {
        self.mutate_and_notify(task_id, |state| {
            state.status = TaskStatus::Completed;
            state.progress = Some(100);
            if let Some(total) = state.total_steps {
                state.current_step = Some(total);
            }
            state.completed_at = Some(self.clock.now());
        });
    }

    /// `FailTask`: `-> Failed`, `CompletedAt = now` (after retries exhausted).
    pub fn fail_task(&self, task_id: TaskId) {
        self.mutate_and_notify(task_id, |state| {
            state.status = TaskStatus::Failed;
            state.completed_at = Some(self.clock.now());
        });
    }

    /// `CancelTask`: `-> Cancelled`, `CompletedAt = now` (shutdown signal).
    pub fn cancel_task(&self, task_id: TaskId) {
        self.mutate_and_notify(task_id, |state| {
            state.status = TaskStatus::Cancelled;
            state.completed_at = Some(self.clock.now());
        });
    }

    /// A retry resets progress to 0 without leaving `Processing` — retries
    /// are internal to the worker, invisible as a separate status.
    pub fn reset_progress_for_retry(&self, task_id: TaskId) {
        self.mutate_and_notify(task_id, |state| {
            state.progress = Some(0);
            state.current_step = None;
            state.message = None;
        });
    }

    fn mutate_and_notify(&self, task_id: TaskId, mutate: impl FnOnce(&mut TaskState)) {
        self.mutate_and_notify_if(task_id, |state| {
            mutate(state);
            true
        });
    }

    fn mutate_and_notify_if(&self, task_id: TaskId, mutate: impl FnOnce(&mut TaskState) -> bool) {
        let Some(mut entry) = self.states.get_mut(&task_id) else {
            return;
        };
        if mutate(&mut entry) {
            let snapshot = entry.clone();
            drop(entry);
            self.notify(&snapshot);
        }
    }

    /// `GetTaskState(taskId)`.
    pub fn get(&self, task_id: TaskId) -> Option<TaskState> {
        self.states.get(&task_id).map(|entry| entry.clone())
    }

    /// `GetActiveTasks(extensionId?)`: only `Pending` or `Processing`.
    pub fn active_tasks(&self, extension_id: Option<&ExtensionId>) -> Vec<TaskState> {
        self.states
            .iter()
            .filter(|entry| entry.status.is_active())
            .filter(|entry| match extension_id {
                Some(ext) => entry.extension_id.as_ref() == Some(ext),
                None => true,
            })
            .map(|entry| entry.clone())
            .collect()
    }

    /// `OnChange(handler)`: every state change, unfiltered.
    pub fn on_change(self: &Arc<Self>, handler: impl Fn(&TaskState) + Send + Sync + 'static) -> StateChangeHandle {
        let id = Uuid::new_v4();
        self.global.insert(id, Arc::new(handler));
        self.handle_for(id, {
            let store = Arc::clone(self);
            move |id| {
                store.global.remove(&id);
            }
        })
    }

    /// `OnChange(extensionId, handler)`.
    pub fn on_change_for_extension(
        self: &Arc<Self>,
        extension_id: ExtensionId,
        handler: impl Fn(&TaskState) + Send + Sync + 'static,
    ) -> StateChangeHandle {
        let id = Uuid::new_v4();
        self.by_extension
            .insert(id, (extension_id, Arc::new(handler)));
        self.handle_for(id, {
            let store = Arc::clone(self);
            move |id| {
                store.by_extension.remove(&id);
            }
        })
    }

    /// `OnChange<T>(handler)`: filtered to a task type, with a typed
    /// down-conversion of `TaskData` applied before the caller's closure
    /// runs.
    pub fn on_change_typed<T: 'static>(
        self: &Arc<Self>,
        task_type: impl Into<String>,
        handler: impl Fn(&TaskState, &T) + Send + Sync + 'static,
    ) -> StateChangeHandle {
        let id = Uuid::new_v4();
        let wrapped: Observer = Arc::new(move |state: &TaskState| {
            if let Some(data) = state.task_data_as::<T>() {
                handler(state, &data);
            }
        });
        self.by_type.insert(id, (task_type.into(), wrapped));
        self.handle_for(id, {
            let store = Arc::clone(self);
            move |id| {
                store.by_type.remove(&id);
            }
        })
    }

    /// `OnChange<T>(extensionId, handler)`.
    pub fn on_change_typed_for_extension<T: 'static>(
        self: &Arc<Self>,
        task_type: impl Into<String>,
        extension_id: ExtensionId,
        handler: impl Fn(&TaskState, &T) + Send + Sync + 'static,
    ) -> StateChangeHandle {
        let id = Uuid::new_v4();
        let wrapped: Observer = Arc::new(move |state: &TaskState| {
            if let Some(data) = state.task_data_as::<T>() {
                handler(state, &data);
            }
        });
        self.by_type_and_extension
            .insert(id, (task_type.into(), extension_id, wrapped));
        self.handle_for(id, {
            let store = Arc::clone(self);
            move |id| {
                store.by_type_and_extension.remove(&id);
            }
        })
    }

    fn handle_for(&self, id: Uuid, remove: impl Fn(Uuid) + Send + Sync + 'static) -> StateChangeHandle {
        StateChangeHandle {
            id,
            remove: Box::new(remove),
        }
    }

    /// Fan out `state` to every observer registry it matches. Observer
    /// callbacks are fire-and-forget: a panic inside one is caught and
    /// discarded, never propagated.
    fn notify(&self, state: &TaskState) {
        for entry in self.global.iter() {
            call_observer(entry.value(), state);
        }
        if let Some(extension_id) = &state.extension_id {
            for entry in self.by_extension.iter() {
                let (filter, observer) = entry.value();
                if filter == extension_id {
                    call_observer(observer, state);
                }
            }
        }
        for entry in self.by_type.iter() {
            let (filter, observer) = entry.value();
            if *filter == state.task_type {
                call_observer(observer, state);
            }
        }
        if let Some(extension_id) = &state.extension_id {
            for entry in self.by_type_and_extension.iter() {
                let (type_filter, ext_filter, observer) = entry.value();
                if *type_filter == state.task_type && ext_filter == extension_id {
                    call_observer(observer, state);
                }
            }
        }
    }

    /// Sweep terminal states whose `CompletedAt` is older than `retention`.
    pub fn gc_tick(&self) {
        let now = self.clock.now();
        let retention = self.retention;
        self.states.retain(|_, state| {
            !(state.status.is_terminal()
                && state
                    .completed_at
                    .map(|completed| now - completed > chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX))
                    .unwrap_or(false))
        });
    }

    /// Spawn the periodic GC ticker.
    pub fn spawn_gc_ticker(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => store.gc_tick(),
                }
            }
        });
    }
}

fn call_observer(observer: &Observer, state: &TaskState) {
    let observer = AssertUnwindSafe(observer);
    let state = AssertUnwindSafe(state);
    if std::panic::catch_unwind(move || (observer.0)(state.0)).is_err() {
        warn!(task_id = %state.0.task_id, "task state observer panicked; discarding");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_core::FrozenClock;
    use std::sync::Mutex as StdMutex;

    fn store_with_clock() -> (Arc<TaskStateStore>, Arc<FrozenClock>) {
        let clock = Arc::new(FrozenClock::new(chrono::Utc::now()));
        let store = TaskStateStore::new(Arc::clone(&clock) as Arc<dyn Clock>, Duration::from_secs(1800));
        (store, clock)
    }

    #[test]
    fn create_then_complete_transitions_and_notifies_global_observer() {
        let (store, _clock) = store_with_clock();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_for_closure = Arc::clone(&seen);
        let _handle = store.on_change(move |state| {
            seen_for_closure.lock().unwrap().push(state.status);
        });

        let task_id = TaskId::new();
        store.create(task_id, "demo", None, Arc::new(()));
        store.start_task(task_id);
        store.complete_task(task_id);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![TaskStatus::Pending, TaskStatus::Processing, TaskStatus::Completed]
        );
        let final_state = store.get(task_id).unwrap();
        assert_eq!(final_state.progress, Some(100));
    }

    #[test]
    fn active_tasks_never_includes_terminal_states() {
        let (store, _clock) = store_with_clock();
        let pending = TaskId::new();
        let completed = TaskId::new();
        store.create(pending, "demo", None, Arc::new(()));
        store.create(completed, "demo", None, Arc::new(()));
        store.complete_task(completed);

        let active = store.active_tasks(None);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].task_id, pending);
    }

    #[test]
    fn extension_filtered_observer_only_sees_matching_tasks() {
        let (store, _clock) = store_with_clock();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_for_closure = Arc::clone(&seen);
        let tenant = ExtensionId::new("tenant-a");
        let _handle = store.on_change_for_extension(tenant.clone(), move |state| {
            seen_for_closure.lock().unwrap().push(state.task_id);
        });

        let matching = TaskId::new();
        let other = TaskId::new();
        store.create(matching, "demo", Some(tenant), Arc::new(()));
        store.create(other, "demo", Some(ExtensionId::new("tenant-b")), Arc::new(()));

        assert_eq!(*seen.lock().unwrap(), vec![matching]);
    }

    #[test]
    fn typed_observer_down_converts_and_suppresses_mismatches() {
        let (store, _clock) = store_with_clock();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_for_closure = Arc::clone(&seen);
        let _handle = store.on_change_typed::<i32>("demo", move |_state, value| {
            seen_for_closure.lock().unwrap().push(*value);
        });

        let matches_type = TaskId::new();
        store.create(matches_type, "demo", None, Arc::new(7i32));
        let different_type = TaskId::new();
        store.create(different_type, "other", None, Arc::new(9i32));

        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn cancelling_a_handle_stops_further_notifications() {
        let (store, _clock) = store_with_clock();
        let seen = Arc::new(StdMutex::new(0usize));
        let seen_for_closure = Arc::clone(&seen);
        let handle = store.on_change(move |_state| {
            *seen_for_closure.lock().unwrap() += 1;
        });

        let task_id = TaskId::new();
        store.create(task_id, "demo", None, Arc::new(()));
        handle.cancel();
        store.complete_task(task_id);

        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn observer_panic_is_caught_and_does_not_break_the_store() {
        let (store, _clock) = store_with_clock();
        let _handle = store.on_change(|_state| panic!("boom"));
        let seen = Arc::new(StdMutex::new(0usize));
        let seen_for_closure = Arc::clone(&seen);
        let _second_handle = store.on_change(move |_state| {
            *seen_for_closure.lock().unwrap() += 1;
        });

        let task_id = TaskId::new();
        store.create(task_id, "demo", None, Arc::new(()));
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn gc_sweeps_terminal_states_past_retention_and_leaves_active_ones() {
        let clock = Arc::new(FrozenClock::new(chrono::Utc::now()));
        let store = TaskStateStore::new(Arc::clone(&clock) as Arc<dyn Clock>, Duration::from_secs(60));

        let old_completed = TaskId::new();
        let fresh_completed = TaskId::new();
        let pending = TaskId::new();
        store.create(old_completed, "demo", None, Arc::new(()));
        store.create(fresh_completed, "demo", None, Arc::new(()));
        store.create(pending, "demo", None, Arc::new(()));

        store.complete_task(old_completed);
        clock.advance(chrono::Duration::seconds(120));
        store.complete_task(fresh_completed);

        store.gc_tick();

        assert!(store.get(old_completed).is_none());
        assert!(store.get(fresh_completed).is_some());
        assert!(store.get(pending).is_some());
    }
}
