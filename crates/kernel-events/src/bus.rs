//! Maps event-name to a set of subscriptions; publishes synchronously-enqueues.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kernel_core::{HandlerResolver, RoutingKey};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::handler::EventHandler;
use crate::options::EventOptions;
use crate::subscription::{spawn_subscription, ErasedEventSubscription};
use crate::transaction::EventTransaction;

type AnyBox = Box<dyn Any + Send>;

/// Handle to a live event subscription returned by [`EventBus::subscribe`]
/// and [`EventBus::subscribe_named`].
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: Uuid,
    routing_key: RoutingKey,
    inner: Arc<dyn ErasedEventSubscription>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("routing_key", &self.routing_key)
            .finish()
    }
}

impl SubscriptionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }

    /// Stop accepting new events and let the worker pool drain what's
    /// already queued, up to `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown(grace).await;
    }
}

/// The event bus: routing table from [`RoutingKey`] to the subscriptions
/// fanned out to on publish.
pub struct EventBus {
    subscriptions: DashMap<RoutingKey, Vec<Arc<dyn ErasedEventSubscription>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("routing_keys", &self.subscriptions.len())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            subscriptions: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// `Subscribe<E>(handler, options)`: routing key is `E`'s type name.
    pub fn subscribe<E, H>(
        &self,
        resolver: Arc<dyn HandlerResolver<H>>,
        options: EventOptions,
    ) -> SubscriptionHandle
    where
        E: Send + 'static,
        H: EventHandler<E> + 'static,
    {
        self.subscribe_key(RoutingKey::of::<E>(), resolver, options)
    }

    /// `Subscribe(name, handler, options)`: an explicit routing key, for
    /// cross-type groupings.
    pub fn subscribe_named<E, H>(
        &self,
        name: impl Into<String>,
        resolver: Arc<dyn HandlerResolver<H>>,
        options: EventOptions,
    ) -> SubscriptionHandle
    where
        E: Send + 'static,
        H: EventHandler<E> + 'static,
    {
        self.subscribe_key(RoutingKey::named(name.into()), resolver, options)
    }

    fn subscribe_key<E, H>(
        &self,
        key: RoutingKey,
        resolver: Arc<dyn HandlerResolver<H>>,
        options: EventOptions,
    ) -> SubscriptionHandle
    where
        E: Send + 'static,
        H: EventHandler<E> + 'static,
    {
        let id = Uuid::new_v4();
        let erased = spawn_subscription::<E, H>(
            id,
            key.clone(),
            resolver,
            options,
            self.shutdown.child_token(),
        );
        self.subscriptions
            .entry(key.clone())
            .or_default()
            .push(Arc::clone(&erased) as Arc<dyn ErasedEventSubscription>);
        SubscriptionHandle {
            id,
            routing_key: key,
            inner: erased,
        }
    }

    /// `Publish<E>(e)`: routing key is `E`'s type name.
    #[instrument(skip(self, event))]
    pub fn publish<E>(&self, event: E)
    where
        E: Clone + Send + Sync + 'static,
    {
        self.publish_key(RoutingKey::of::<E>(), event);
    }

    /// `Publish(name, e)`: an explicit routing key.
    #[instrument(skip(self, event))]
    pub fn publish_named<E>(&self, name: impl Into<String>, event: E)
    where
        E: Clone + Send + Sync + 'static,
    {
        self.publish_key(RoutingKey::named(name.into()), event);
    }

    /// Enqueue `event` onto every subscription registered for `key` and
    /// return. Never waits for a handler to run.
    pub(crate) fn publish_key<E>(&self, key: RoutingKey, event: E)
    where
        E: Clone + Send + Sync + 'static,
    {
        if let Some(subs) = self.subscriptions.get(&key) {
            for sub in subs.value().iter() {
                let boxed: AnyBox = Box::new(event.clone());
                sub.enqueue(boxed);
            }
        }
    }

    /// `CreateTransaction()`.
    pub fn create_transaction(self: &Arc<Self>) -> EventTransaction {
        EventTransaction::new(Arc::clone(self))
    }

    /// Total number of live subscriptions across every routing key, for
    /// introspection (e.g. a host's health snapshot).
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.iter().map(|entry| entry.value().len()).sum()
    }

    /// Stop every subscription's worker pool, draining up to `grace` each.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        for entry in self.subscriptions.iter() {
            for sub in entry.value() {
                sub.shutdown(grace).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::EventHandler;
    use async_trait::async_trait;
    use kernel_core::SingletonResolver;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration as StdDuration;
    use tokio_util::sync::CancellationToken as Cancel;

    #[derive(Clone)]
    struct Greeting(String);

    struct Recorder {
        seen: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventHandler<Greeting> for Recorder {
        async fn handle(&self, event: Greeting, _cancel: Cancel) -> kernel_core::KernelResult<()> {
            self.seen.lock().unwrap().push(event.0);
            Ok(())
        }
    }

    #[tokio::test]
    async fn publish_fans_out_to_every_subscriber() {
        let bus = EventBus::new();
        let seen1 = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = Arc::new(StdMutex::new(Vec::new()));

        bus.subscribe::<Greeting, _>(
            Arc::new(SingletonResolver::new(Arc::new(Recorder {
                seen: Arc::clone(&seen1),
            }))),
            EventOptions::default(),
        );
        bus.subscribe::<Greeting, _>(
            Arc::new(SingletonResolver::new(Arc::new(Recorder {
                seen: Arc::clone(&seen2),
            }))),
            EventOptions::default(),
        );

        bus.publish(Greeting("hi".to_string()));
        bus.shutdown(StdDuration::from_secs(1)).await;

        assert_eq!(*seen1.lock().unwrap(), vec!["hi".to_string()]);
        assert_eq!(*seen2.lock().unwrap(), vec!["hi".to_string()]);
    }

    struct SlowHandler;

    #[async_trait]
    impl EventHandler<Greeting> for SlowHandler {
        async fn handle(&self, _event: Greeting, _cancel: Cancel) -> kernel_core::KernelResult<()> {
            tokio::time::sleep(StdDuration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn timed_out_handler_counts_as_failure_and_continues() {
        let bus = EventBus::new();
        bus.subscribe::<Greeting, _>(
            Arc::new(SingletonResolver::new(Arc::new(SlowHandler))),
            EventOptions {
                worker_count: 1,
                timeout: StdDuration::from_millis(20),
                continue_on_error: true,
            },
        );

        bus.publish(Greeting("slow".to_string()));
        // The handler times out but the worker should still be alive to
        // accept and (eventually time out on) a second message.
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        bus.shutdown(StdDuration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn unknown_routing_key_is_a_silent_no_op() {
        let bus = EventBus::new();
        // No subscribers for `Greeting` at all; publish must not panic.
        bus.publish(Greeting("into the void".to_string()));
        bus.shutdown(StdDuration::from_millis(50)).await;
    }
}
