//! The `Kernel` handle: the one object a host holds to send commands,
//! publish/subscribe to events, and publish/subscribe to tasks.

use std::sync::Arc;
use std::time::Duration;

use kernel_commands::{CommandDispatcher, CommandHandler, Request};
use kernel_core::{Clock, ExtensionId, HandlerResolver, KernelConfig, KernelResult, TaskId};
use kernel_events::{EventBus, EventHandler, EventOptions, EventTransaction, SubscriptionHandle};
use kernel_tasks::{TaskEngine, TaskHandler, TaskOptions, TaskState};
use kernel_tasks::{StateChangeHandle, TaskSubscriptionHandle};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::health::KernelHealth;

/// The three engines, wired together behind one handle. Each engine crate
/// remains independently usable; `Kernel` is the facade a host embeds when
/// it wants all three.
pub struct Kernel {
    commands: CommandDispatcher,
    events: Arc<EventBus>,
    tasks: Arc<TaskEngine>,
    config: KernelConfig,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("commands", &self.commands)
            .field("events", &self.events)
            .field("tasks", &self.tasks)
            .finish()
    }
}

impl Kernel {
    pub(crate) fn new(config: KernelConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        let events = Arc::new(EventBus::new());
        let tasks = TaskEngine::new(
            Arc::clone(&clock),
            &config.state_store,
            config.progress.tick_interval,
        );
        Arc::new(Kernel {
            commands: CommandDispatcher::new(),
            events,
            tasks,
            config,
        })
    }

    // --- Commands (component B) -------------------------------------------------

    /// Register the one handler for request type `R`. Rejects a second
    /// registration for the same `R` with [`KernelError::DuplicateHandler`].
    pub fn register_command<R, H>(&self, resolver: Arc<dyn HandlerResolver<H>>) -> KernelResult<()>
    where
        R: Request,
        H: CommandHandler<R> + 'static,
    {
        self.commands.register::<R, H>(resolver)
    }

    /// `Send<R>(req): R::Response`, with no external cancellation signal.
    pub async fn send<R: Request>(&self, request: R) -> KernelResult<R::Response> {
        self.commands.send(request).await
    }

    /// `Send<R>(req): R::Response`, racing the handler against `cancel`.
    pub async fn send_with_cancel<R: Request>(
        &self,
        request: R,
        cancel: CancellationToken,
    ) -> KernelResult<R::Response> {
        self.commands.send_with_cancel(request, cancel).await
    }

    // --- Events (components C/D/E) ----------------------------------------------

    /// `Subscribe<E>(handler, options)`. `options` defaults to the kernel's
    /// configured event defaults when `None`.
    pub fn subscribe_event<E, H>(
        &self,
        resolver: Arc<dyn HandlerResolver<H>>,
        options: Option<EventOptions>,
    ) -> SubscriptionHandle
    where
        E: Send + 'static,
        H: EventHandler<E> + 'static,
    {
        let options = options.unwrap_or_else(|| EventOptions::from(&self.config.events));
        self.events.subscribe::<E, H>(resolver, options)
    }

    /// `Subscribe(name, handler, options)`.
    pub fn subscribe_event_named<E, H>(
        &self,
        name: impl Into<String>,
        resolver: Arc<dyn HandlerResolver<H>>,
        options: Option<EventOptions>,
    ) -> SubscriptionHandle
    where
        E: Send + 'static,
        H: EventHandler<E> + 'static,
    {
        let options = options.unwrap_or_else(|| EventOptions::from(&self.config.events));
        self.events.subscribe_named::<E, H>(name, resolver, options)
    }

    /// `Publish<E>(e)`.
    #[instrument(skip(self, event))]
    pub fn publish_event<E>(&self, event: E)
    where
        E: Clone + Send + Sync + 'static,
    {
        self.events.publish(event);
    }

    /// `Publish(name, e)`.
    #[instrument(skip(self, event))]
    pub fn publish_event_named<E>(&self, name: impl Into<String>, event: E)
    where
        E: Clone + Send + Sync + 'static,
    {
        self.events.publish_named(name, event);
    }

    /// `CreateTransaction()`.
    pub fn create_transaction(&self) -> EventTransaction {
        self.events.create_transaction()
    }

    // --- Tasks (components F/G/H/I) ---------------------------------------------

    /// `Subscribe<T>(handler, options)`. `options` defaults to the kernel's
    /// configured task defaults when `None`.
    pub fn subscribe_task<T, H>(
        &self,
        resolver: Arc<dyn HandlerResolver<H>>,
        options: Option<TaskOptions>,
    ) -> TaskSubscriptionHandle
    where
        T: Clone + Send + Sync + 'static,
        H: TaskHandler<T> + 'static,
    {
        let options = options.unwrap_or_else(|| TaskOptions::from_defaults(&self.config.tasks));
        self.tasks.subscribe::<T, H>(resolver, options)
    }

    /// `Subscribe(name, handler, options)`.
    pub fn subscribe_task_named<T, H>(
        &self,
        name: impl Into<String>,
        resolver: Arc<dyn HandlerResolver<H>>,
        options: Option<TaskOptions>,
    ) -> TaskSubscriptionHandle
    where
        T: Clone + Send + Sync + 'static,
        H: TaskHandler<T> + 'static,
    {
        let options = options.unwrap_or_else(|| TaskOptions::from_defaults(&self.config.tasks));
        self.tasks.subscribe_named::<T, H>(name, resolver, options)
    }

    /// `Publish<T>(t, extensionId?)`.
    #[instrument(skip(self, data))]
    pub fn publish_task<T>(&self, data: T, extension_id: Option<ExtensionId>) -> KernelResult<TaskId>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.tasks.publish(data, extension_id)
    }

    /// `Publish(name, t, extensionId?)`.
    #[instrument(skip(self, data))]
    pub fn publish_task_named<T>(
        &self,
        name: impl Into<String>,
        data: T,
        extension_id: Option<ExtensionId>,
    ) -> KernelResult<TaskId>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.tasks.publish_named(name, data, extension_id)
    }

    /// `GetTaskState(taskId)`.
    pub fn get_task_state(&self, task_id: TaskId) -> Option<TaskState> {
        self.tasks.get_task_state(task_id)
    }

    /// `GetActiveTasks(extensionId?)`.
    pub fn active_tasks(&self, extension_id: Option<&ExtensionId>) -> Vec<TaskState> {
        self.tasks.active_tasks(extension_id)
    }

    /// `OnChange(handler)`.
    pub fn on_change(&self, handler: impl Fn(&TaskState) + Send + Sync + 'static) -> StateChangeHandle {
        self.tasks.on_change(handler)
    }

    /// `OnChange(extensionId, handler)`.
    pub fn on_change_for_extension(
        &self,
        extension_id: ExtensionId,
        handler: impl Fn(&TaskState) + Send + Sync + 'static,
    ) -> StateChangeHandle {
        self.tasks.on_change_for_extension(extension_id, handler)
    }

    /// `OnChange<T>(handler)`.
    pub fn on_change_typed<T: 'static>(
        &self,
        task_type: impl Into<String>,
        handler: impl Fn(&TaskState, &T) + Send + Sync + 'static,
    ) -> StateChangeHandle {
        self.tasks.on_change_typed(task_type, handler)
    }

    /// `OnChange<T>(extensionId, handler)`.
    pub fn on_change_typed_for_extension<T: 'static>(
        &self,
        task_type: impl Into<String>,
        extension_id: ExtensionId,
        handler: impl Fn(&TaskState, &T) + Send + Sync + 'static,
    ) -> StateChangeHandle {
        self.tasks
            .on_change_typed_for_extension(task_type, extension_id, handler)
    }

    /// Force an immediate state store GC sweep, bypassing the periodic
    /// ticker. Exposed for tests and hosts that want to drive retention
    /// deterministically.
    pub fn gc_tick(&self) {
        self.tasks.gc_tick();
    }

    // --- Cross-cutting ------------------------------------------------------

    /// A read-only snapshot of live subscription/task counts, for a host's
    /// own health endpoint. Not a persisted or exported metrics pipeline.
    pub fn health(&self) -> KernelHealth {
        KernelHealth {
            registered_commands: self.commands.registered_handler_count(),
            event_subscriptions: self.events.subscription_count(),
            task_subscriptions: self.tasks.subscription_count(),
            active_tasks: self.tasks.active_tasks(None).len(),
        }
    }

    /// Stop every engine's worker pools, draining up to `grace` each.
    pub async fn shutdown(&self, grace: Duration) {
        self.events.shutdown(grace).await;
        self.tasks.shutdown(grace).await;
    }
}
