//! A single task subscription: handler + worker pool + retry loop
//! (`spec.md` §3 "Subscription", §4.F "Task worker loop").
//!
//! Unlike an event, exactly one subscription consumes each task routing
//! key — there is no fan-out — so the routing table in [`crate::engine`]
//! holds a single [`ErasedTaskSubscription`] per key rather than a `Vec`.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kernel_core::{invoke_with_deadline, ExtensionId, HandlerResolver, InvocationOutcome, RoutingKey, TaskId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::handler::{TaskHandler, TaskPayload};
use crate::options::TaskOptions;
use crate::progress::{ProgressContext, ProgressUpdate};
use crate::store::TaskStateStore;

type AnyBox = Box<dyn Any + Send>;

struct TaskItem<T> {
    task_id: TaskId,
    extension_id: Option<ExtensionId>,
    data: T,
}

/// Type-erased surface the task routing table holds: enqueue plus pool
/// shutdown, with the concrete task type hidden behind the downcast
/// performed in `TypedSubscription::enqueue`.
#[async_trait]
pub(crate) trait ErasedTaskSubscription: Send + Sync {
    #[allow(dead_code)]
    fn id(&self) -> Uuid;
    fn enqueue(&self, task_id: TaskId, extension_id: Option<ExtensionId>, payload: AnyBox);
    async fn shutdown(&self, grace: Duration);
}

pub(crate) struct TypedSubscription<T> {
    id: Uuid,
    routing_key: RoutingKey,
    sender: Mutex<Option<mpsc::UnboundedSender<TaskItem<T>>>>,
    shutdown_token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl<T: Send + 'static> ErasedTaskSubscription for TypedSubscription<T> {
    fn id(&self) -> Uuid {
        self.id
    }

    fn enqueue(&self, task_id: TaskId, extension_id: Option<ExtensionId>, payload: AnyBox) {
        match payload.downcast::<T>() {
            Ok(data) => {
                let sender = self
                    .sender
                    .lock()
                    .expect("task subscription sender lock poisoned");
                if let Some(sender) = sender.as_ref() {
                    let _ = sender.send(TaskItem {
                        task_id,
                        extension_id,
                        data: *data,
                    });
                }
            }
            Err(_) => {
                warn!(
                    routing_key = %self.routing_key,
                    expected = std::any::type_name::<T>(),
                    "dropping task: payload type mismatch"
                );
            }
        }
    }

    async fn shutdown(&self, grace: Duration) {
        self.shutdown_token.cancel();
        self.sender
            .lock()
            .expect("task subscription sender lock poisoned")
            .take();
        let workers = {
            let mut guard = self
                .workers
                .lock()
                .expect("task subscription workers lock poisoned");
            std::mem::take(&mut *guard)
        };
        let drain = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(
                routing_key = %self.routing_key,
                "task subscription workers did not drain within the shutdown grace period"
            );
        }
    }
}

/// Spawn `options.worker_count` cooperative workers draining a fresh
/// unbounded queue, running the attempt/retry loop from `spec.md` §4.F for
/// every dequeued task.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_subscription<T, H>(
    id: Uuid,
    routing_key: RoutingKey,
    resolver: Arc<dyn HandlerResolver<H>>,
    options: TaskOptions,
    store: Arc<TaskStateStore>,
    progress_tick_interval: Duration,
    shutdown_token: CancellationToken,
) -> Arc<TypedSubscription<T>>
where
    T: Clone + Send + Sync + 'static,
    H: TaskHandler<T> + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<TaskItem<T>>();
    let receiver = Arc::new(tokio::sync::Mutex::new(rx));

    let worker_count = options.worker_count.max(1);
    let mut workers = Vec::with_capacity(worker_count);
    for worker_index in 0..worker_count {
        let receiver = Arc::clone(&receiver);
        let resolver = Arc::clone(&resolver);
        let routing_key = routing_key.clone();
        let options = options.clone();
        let store = Arc::clone(&store);
        let shutdown_token = shutdown_token.clone();
        workers.push(tokio::spawn(async move {
            worker_loop::<T, H>(
                worker_index,
                receiver,
                resolver,
                routing_key,
                options,
                store,
                progress_tick_interval,
                shutdown_token,
            )
            .await;
        }));
    }

    Arc::new(TypedSubscription {
        id,
        routing_key,
        sender: Mutex::new(Some(tx)),
        shutdown_token,
        workers: Mutex::new(workers),
    })
}

#[instrument(skip_all, fields(routing_key = %routing_key, worker_index))]
async fn worker_loop<T, H>(
    worker_index: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TaskItem<T>>>>,
    resolver: Arc<dyn HandlerResolver<H>>,
    routing_key: RoutingKey,
    options: TaskOptions,
    store: Arc<TaskStateStore>,
    progress_tick_interval: Duration,
    shutdown_token: CancellationToken,
) where
    T: Clone + Send + Sync + 'static,
    H: TaskHandler<T> + 'static,
{
    loop {
        let item = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(item) = item else {
            break;
        };

        store.start_task(item.task_id);

        let steps = options.progress_steps.clone().unwrap_or_default();
        let mut attempt = 0u32;
        let mut keep_running = true;

        'attempts: loop {
            let store_for_update = Arc::clone(&store);
            let task_id = item.task_id;
            let on_update: Arc<dyn Fn(ProgressUpdate) + Send + Sync> = Arc::new(move |update: ProgressUpdate| {
                store_for_update.update_progress(
                    task_id,
                    update.percent,
                    update.current_step,
                    update.total_steps,
                    update.message,
                );
            });
            let progress_ctx = ProgressContext::new(steps.clone(), progress_tick_interval, on_update);

            let scoped = match resolver.resolve().await {
                Ok(scoped) => scoped,
                Err(err) => {
                    warn!(routing_key = %routing_key, error = %err, "failed to resolve task handler");
                    progress_ctx.dispose_and_wait().await;
                    if attempt < options.max_retries {
                        store.reset_progress_for_retry(item.task_id);
                        if !sleep_honoring_shutdown(options.retry_delay, &shutdown_token).await {
                            store.cancel_task(item.task_id);
                            break 'attempts;
                        }
                        attempt += 1;
                        continue 'attempts;
                    }
                    store.fail_task(item.task_id);
                    keep_running = options.continue_on_error;
                    break 'attempts;
                }
            };

            let payload_data = item.data.clone();
            let extension_id = item.extension_id.clone();
            let progress_for_payload = Arc::clone(&progress_ctx);
            let outcome = invoke_with_deadline(&shutdown_token, options.timeout, move |cancel| async move {
                scoped
                    .handle(TaskPayload {
                        data: payload_data,
                        task_id,
                        extension_id,
                        progress: progress_for_payload,
                        cancel,
                    })
                    .await
            })
            .await;

            match outcome {
                InvocationOutcome::Completed(Ok(())) => {
                    progress_ctx.dispose_and_wait().await;
                    store.complete_task(item.task_id);
                    break 'attempts;
                }
                InvocationOutcome::Cancelled => {
                    progress_ctx.dispose_and_wait().await;
                    store.cancel_task(item.task_id);
                    break 'attempts;
                }
                InvocationOutcome::TimedOut => {
                    progress_ctx.dispose_and_wait().await;
                    warn!(routing_key = %routing_key, attempt, "task handler timed out");
                    if attempt < options.max_retries {
                        store.reset_progress_for_retry(item.task_id);
                        if !sleep_honoring_shutdown(options.retry_delay, &shutdown_token).await {
                            store.cancel_task(item.task_id);
                            break 'attempts;
                        }
                        attempt += 1;
                        continue 'attempts;
                    }
                    store.fail_task(item.task_id);
                    keep_running = options.continue_on_error;
                    break 'attempts;
                }
                InvocationOutcome::Completed(Err(err)) => {
                    progress_ctx.dispose_and_wait().await;
                    warn!(routing_key = %routing_key, attempt, error = %err, "task handler failed");
                    if attempt < options.max_retries {
                        store.reset_progress_for_retry(item.task_id);
                        if !sleep_honoring_shutdown(options.retry_delay, &shutdown_token).await {
                            store.cancel_task(item.task_id);
                            break 'attempts;
                        }
                        attempt += 1;
                        continue 'attempts;
                    }
                    store.fail_task(item.task_id);
                    keep_running = options.continue_on_error;
                    break 'attempts;
                }
            }
        }

        if !keep_running {
            break;
        }
    }
}

/// Sleep for `delay`, returning `false` early if shutdown fires first.
async fn sleep_honoring_shutdown(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_core::{Clock, FrozenClock, KernelError, SingletonResolver};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskHandler<u32> for CountingHandler {
        async fn handle(&self, payload: TaskPayload<u32>) -> kernel_core::KernelResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = payload.data;
            Ok(())
        }
    }

    struct AlwaysFailsHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskHandler<u32> for AlwaysFailsHandler {
        async fn handle(&self, _payload: TaskPayload<u32>) -> kernel_core::KernelResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(KernelError::handler_message("AlwaysFails", "boom"))
        }
    }

    struct FailsOnceHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskHandler<u32> for FailsOnceHandler {
        async fn handle(&self, _payload: TaskPayload<u32>) -> kernel_core::KernelResult<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(KernelError::handler_message("FailsOnce", "transient"))
            } else {
                Ok(())
            }
        }
    }

    fn store() -> Arc<TaskStateStore> {
        let clock = Arc::new(FrozenClock::new(chrono::Utc::now())) as Arc<dyn Clock>;
        TaskStateStore::new(clock, Duration::from_secs(1800))
    }

    #[tokio::test]
    async fn successful_task_transitions_to_completed() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = spawn_subscription::<u32, CountingHandler>(
            Uuid::new_v4(),
            RoutingKey::named("counter"),
            Arc::new(SingletonResolver::new(Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
            }))),
            TaskOptions {
                worker_count: 1,
                ..TaskOptions::default()
            },
            Arc::clone(&store),
            Duration::from_millis(20),
            CancellationToken::new(),
        );

        let task_id = TaskId::new();
        store.create(task_id, "counter", None, Arc::new(7u32));
        sub.enqueue(task_id, None, Box::new(7u32));
        sub.shutdown(Duration::from_secs(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let state = store.get(task_id).unwrap();
        assert_eq!(state.status, crate::state::TaskStatus::Completed);
        assert_eq!(state.progress, Some(100));
    }

    #[tokio::test]
    async fn retries_up_to_max_retries_then_succeeds() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = spawn_subscription::<u32, FailsOnceHandler>(
            Uuid::new_v4(),
            RoutingKey::named("flaky"),
            Arc::new(SingletonResolver::new(Arc::new(FailsOnceHandler {
                calls: Arc::clone(&calls),
            }))),
            TaskOptions {
                worker_count: 1,
                max_retries: 2,
                retry_delay: Duration::from_millis(1),
                ..TaskOptions::default()
            },
            Arc::clone(&store),
            Duration::from_millis(20),
            CancellationToken::new(),
        );

        let task_id = TaskId::new();
        store.create(task_id, "flaky", None, Arc::new(1u32));
        sub.enqueue(task_id, None, Box::new(1u32));
        sub.shutdown(Duration::from_secs(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let state = store.get(task_id).unwrap();
        assert_eq!(state.status, crate::state::TaskStatus::Completed);
    }

    #[tokio::test]
    async fn exhausting_retries_fails_and_continues_to_next_task() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = spawn_subscription::<u32, AlwaysFailsHandler>(
            Uuid::new_v4(),
            RoutingKey::named("broken"),
            Arc::new(SingletonResolver::new(Arc::new(AlwaysFailsHandler {
                calls: Arc::clone(&calls),
            }))),
            TaskOptions {
                worker_count: 1,
                max_retries: 1,
                retry_delay: Duration::from_millis(1),
                continue_on_error: true,
                ..TaskOptions::default()
            },
            Arc::clone(&store),
            Duration::from_millis(20),
            CancellationToken::new(),
        );

        let first = TaskId::new();
        let second = TaskId::new();
        store.create(first, "broken", None, Arc::new(1u32));
        store.create(second, "broken", None, Arc::new(1u32));
        sub.enqueue(first, None, Box::new(1u32));
        sub.enqueue(second, None, Box::new(1u32));
        sub.shutdown(Duration::from_secs(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 4); // 2 attempts each
        assert_eq!(store.get(first).unwrap().status, crate::state::TaskStatus::Failed);
        assert_eq!(store.get(second).unwrap().status, crate::state::TaskStatus::Failed);
    }

    struct NeverFinishesHandler;

    #[async_trait]
    impl TaskHandler<u32> for NeverFinishesHandler {
        async fn handle(&self, _payload: TaskPayload<u32>) -> kernel_core::KernelResult<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn handler_past_its_timeout_fails_the_attempt() {
        let store = store();
        let sub = spawn_subscription::<u32, NeverFinishesHandler>(
            Uuid::new_v4(),
            RoutingKey::named("stuck"),
            Arc::new(SingletonResolver::new(Arc::new(NeverFinishesHandler))),
            TaskOptions {
                worker_count: 1,
                timeout: Duration::from_millis(10),
                max_retries: 0,
                ..TaskOptions::default()
            },
            Arc::clone(&store),
            Duration::from_millis(20),
            CancellationToken::new(),
        );

        let task_id = TaskId::new();
        store.create(task_id, "stuck", None, Arc::new(1u32));
        sub.enqueue(task_id, None, Box::new(1u32));
        sub.shutdown(Duration::from_secs(1)).await;

        assert_eq!(store.get(task_id).unwrap().status, crate::state::TaskStatus::Failed);
    }

    #[tokio::test]
    async fn mismatched_payload_type_is_dropped_not_delivered() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = spawn_subscription::<u32, CountingHandler>(
            Uuid::new_v4(),
            RoutingKey::named("counter"),
            Arc::new(SingletonResolver::new(Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
            }))),
            TaskOptions::default(),
            Arc::clone(&store),
            Duration::from_millis(20),
            CancellationToken::new(),
        );

        sub.enqueue(TaskId::new(), None, Box::new("not a u32".to_string()));
        sub.shutdown(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
