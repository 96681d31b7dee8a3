//! The task engine facade: routing table from task type to its single
//! subscription, plus the state store (`spec.md` §4.F, §4.I, component F).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kernel_core::config::StateStoreDefaults;
use kernel_core::{Clock, ExtensionId, HandlerResolver, KernelError, KernelResult, RoutingKey, TaskId};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::handler::TaskHandler;
use crate::options::TaskOptions;
use crate::state::TaskState;
use crate::store::{StateChangeHandle, TaskStateStore};
use crate::subscription::{spawn_subscription, ErasedTaskSubscription};

/// Handle to a live task subscription returned by [`TaskEngine::subscribe`]
/// and [`TaskEngine::subscribe_named`].
#[derive(Clone)]
pub struct TaskSubscriptionHandle {
    id: Uuid,
    routing_key: RoutingKey,
    inner: Arc<dyn ErasedTaskSubscription>,
}

impl std::fmt::Debug for TaskSubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSubscriptionHandle")
            .field("id", &self.id)
            .field("routing_key", &self.routing_key)
            .finish()
    }
}

impl TaskSubscriptionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }

    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown(grace).await;
    }
}

/// The task engine: single-consumer routing table plus the shared
/// [`TaskStateStore`] (`spec.md` §3 "Subscription"; exactly one subscription
/// processes a given task type, unlike events' fan-out).
pub struct TaskEngine {
    subscriptions: DashMap<RoutingKey, Arc<dyn ErasedTaskSubscription>>,
    store: Arc<TaskStateStore>,
    progress_tick_interval: Duration,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("routing_keys", &self.subscriptions.len())
            .field("store", &self.store)
            .finish()
    }
}

impl TaskEngine {
    pub fn new(clock: Arc<dyn Clock>, state_store_defaults: &StateStoreDefaults, progress_tick_interval: Duration) -> Arc<Self> {
        let store = TaskStateStore::new(clock, state_store_defaults.retention);
        let shutdown = CancellationToken::new();
        store.spawn_gc_ticker(state_store_defaults.gc_interval, shutdown.child_token());
        Arc::new(TaskEngine {
            subscriptions: DashMap::new(),
            store,
            progress_tick_interval,
            shutdown,
        })
    }

    /// `Subscribe<T>(handler, options)`: routing key is `T`'s type name.
    pub fn subscribe<T, H>(
        &self,
        resolver: Arc<dyn HandlerResolver<H>>,
        options: TaskOptions,
    ) -> TaskSubscriptionHandle
    where
        T: Clone + Send + Sync + 'static,
        H: TaskHandler<T> + 'static,
    {
        self.subscribe_key::<T, H>(RoutingKey::of::<T>(), resolver, options)
    }

    /// `Subscribe(name, handler, options)`: an explicit routing key.
    pub fn subscribe_named<T, H>(
        &self,
        name: impl Into<String>,
        resolver: Arc<dyn HandlerResolver<H>>,
        options: TaskOptions,
    ) -> TaskSubscriptionHandle
    where
        T: Clone + Send + Sync + 'static,
        H: TaskHandler<T> + 'static,
    {
        self.subscribe_key::<T, H>(RoutingKey::named(name.into()), resolver, options)
    }

    fn subscribe_key<T, H>(
        &self,
        key: RoutingKey,
        resolver: Arc<dyn HandlerResolver<H>>,
        options: TaskOptions,
    ) -> TaskSubscriptionHandle
    where
        T: Clone + Send + Sync + 'static,
        H: TaskHandler<T> + 'static,
    {
        let id = Uuid::new_v4();
        let erased = spawn_subscription::<T, H>(
            id,
            key.clone(),
            resolver,
            options,
            Arc::clone(&self.store),
            self.progress_tick_interval,
            self.shutdown.child_token(),
        );
        self.subscriptions
            .insert(key.clone(), Arc::clone(&erased) as Arc<dyn ErasedTaskSubscription>);
        TaskSubscriptionHandle {
            id,
            routing_key: key,
            inner: erased,
        }
    }

    /// `Publish<T>(data, extensionId?)`: routing key is `T`'s type name.
    /// Mints a `TaskId`, registers the initial `Pending` state, and routes
    /// the payload to the single subscription for that key.
    #[instrument(skip(self, data))]
    pub fn publish<T>(&self, data: T, extension_id: Option<ExtensionId>) -> KernelResult<TaskId>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.publish_key(RoutingKey::of::<T>(), data, extension_id)
    }

    /// `Publish(name, data, extensionId?)`: an explicit routing key.
    #[instrument(skip(self, data))]
    pub fn publish_named<T>(
        &self,
        name: impl Into<String>,
        data: T,
        extension_id: Option<ExtensionId>,
    ) -> KernelResult<TaskId>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.publish_key(RoutingKey::named(name.into()), data, extension_id)
    }

    fn publish_key<T>(&self, key: RoutingKey, data: T, extension_id: Option<ExtensionId>) -> KernelResult<TaskId>
    where
        T: Clone + Send + Sync + 'static,
    {
        let Some(subscription) = self.subscriptions.get(&key) else {
            return Err(KernelError::NoHandler {
                request_type: std::any::type_name::<T>(),
            });
        };
        let task_id = TaskId::new();
        self.store.create(
            task_id,
            key.as_str(),
            extension_id.clone(),
            Arc::new(data.clone()),
        );
        subscription.enqueue(task_id, extension_id, Box::new(data));
        Ok(task_id)
    }

    /// `GetTaskState(taskId)`.
    pub fn get_task_state(&self, task_id: TaskId) -> Option<TaskState> {
        self.store.get(task_id)
    }

    /// `GetActiveTasks(extensionId?)`.
    pub fn active_tasks(&self, extension_id: Option<&ExtensionId>) -> Vec<TaskState> {
        self.store.active_tasks(extension_id)
    }

    /// `OnChange(handler)`.
    pub fn on_change(&self, handler: impl Fn(&TaskState) + Send + Sync + 'static) -> StateChangeHandle {
        self.store.on_change(handler)
    }

    /// `OnChange(extensionId, handler)`.
    pub fn on_change_for_extension(
        &self,
        extension_id: ExtensionId,
        handler: impl Fn(&TaskState) + Send + Sync + 'static,
    ) -> StateChangeHandle {
        self.store.on_change_for_extension(extension_id, handler)
    }

    /// `OnChange<T>(handler)`.
    pub fn on_change_typed<T: 'static>(
        &self,
        task_type: impl Into<String>,
        handler: impl Fn(&TaskState, &T) + Send + Sync + 'static,
    ) -> StateChangeHandle {
        self.store.on_change_typed(task_type, handler)
    }

    /// `OnChange<T>(extensionId, handler)`.
    pub fn on_change_typed_for_extension<T: 'static>(
        &self,
        task_type: impl Into<String>,
        extension_id: ExtensionId,
        handler: impl Fn(&TaskState, &T) + Send + Sync + 'static,
    ) -> StateChangeHandle {
        self.store
            .on_change_typed_for_extension(task_type, extension_id, handler)
    }

    /// Number of task types with a live subscription, for introspection
    /// (e.g. a host's health snapshot).
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Force an immediate GC sweep, bypassing the periodic ticker
    /// (`spec.md` §4.I, exposed for deterministic test control).
    pub fn gc_tick(&self) {
        self.store.gc_tick();
    }

    /// Stop every subscription's worker pool, draining up to `grace` each,
    /// and stop the GC ticker.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        for entry in self.subscriptions.iter() {
            entry.value().shutdown(grace).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::TaskPayload;
    use async_trait::async_trait;
    use kernel_core::SingletonResolver;
    use kernel_core::SystemClock;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone)]
    struct Greeting(String);

    struct Recorder {
        seen: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl TaskHandler<Greeting> for Recorder {
        async fn handle(&self, payload: TaskPayload<Greeting>) -> KernelResult<()> {
            self.seen.lock().unwrap().push(payload.data.0);
            Ok(())
        }
    }

    fn engine() -> Arc<TaskEngine> {
        TaskEngine::new(
            Arc::new(SystemClock) as Arc<dyn Clock>,
            &StateStoreDefaults::default(),
            Duration::from_millis(20),
        )
    }

    #[tokio::test]
    async fn publish_with_no_subscriber_returns_no_handler() {
        let engine = engine();
        let err = engine.publish(Greeting("hi".to_string()), None).unwrap_err();
        assert!(matches!(err, KernelError::NoHandler { .. }));
    }

    #[tokio::test]
    async fn publish_routes_to_the_single_subscription_and_tracks_state() {
        let engine = engine();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        engine.subscribe::<Greeting, _>(
            Arc::new(SingletonResolver::new(Arc::new(Recorder {
                seen: Arc::clone(&seen),
            }))),
            TaskOptions::default(),
        );

        let task_id = engine.publish(Greeting("hi".to_string()), None).unwrap();
        engine.shutdown(Duration::from_secs(1)).await;

        assert_eq!(*seen.lock().unwrap(), vec!["hi".to_string()]);
        let state = engine.get_task_state(task_id).unwrap();
        assert_eq!(state.status, crate::state::TaskStatus::Completed);
    }

    #[tokio::test]
    async fn gc_tick_can_be_driven_explicitly_in_tests() {
        let engine = engine();
        engine.subscribe::<Greeting, _>(
            Arc::new(SingletonResolver::new(Arc::new(Recorder {
                seen: Arc::new(StdMutex::new(Vec::new())),
            }))),
            TaskOptions::default(),
        );
        let task_id = engine.publish(Greeting("hi".to_string()), None).unwrap();
        engine.shutdown(Duration::from_secs(1)).await;
        assert!(engine.get_task_state(task_id).is_some());
        engine.gc_tick(); // retention default is 30 minutes, nothing should be swept yet
        assert!(engine.get_task_state(task_id).is_some());
    }
}
