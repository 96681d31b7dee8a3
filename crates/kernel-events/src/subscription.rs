//! A single subscription: handler + worker pool + unbounded queue + timeout.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kernel_core::{invoke_with_deadline, HandlerResolver, InvocationOutcome, RoutingKey};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::handler::EventHandler;
use crate::options::EventOptions;

type AnyBox = Box<dyn Any + Send>;

/// Type-erased surface the [`EventBus`](crate::bus::EventBus) routing table
/// holds: payload enqueue plus pool shutdown, with the concrete event type
/// hidden behind the downcast performed in `TypedSubscription::enqueue`.
#[async_trait]
pub(crate) trait ErasedEventSubscription: Send + Sync {
    #[allow(dead_code)]
    fn id(&self) -> Uuid;
    fn enqueue(&self, payload: AnyBox);
    async fn shutdown(&self, grace: Duration);
}

pub(crate) struct TypedSubscription<E> {
    id: Uuid,
    routing_key: RoutingKey,
    sender: Mutex<Option<mpsc::UnboundedSender<E>>>,
    shutdown_token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl<E: Send + 'static> ErasedEventSubscription for TypedSubscription<E> {
    fn id(&self) -> Uuid {
        self.id
    }

    fn enqueue(&self, payload: AnyBox) {
        match payload.downcast::<E>() {
            Ok(event) => {
                let sender = self
                    .sender
                    .lock()
                    .expect("subscription sender lock poisoned");
                if let Some(sender) = sender.as_ref() {
                    // A closed receiver only happens mid-shutdown; dropping
                    // the event there is correct, not an error to surface.
                    let _ = sender.send(*event);
                }
            }
            Err(_) => {
                warn!(
                    routing_key = %self.routing_key,
                    expected = std::any::type_name::<E>(),
                    "dropping event: payload type mismatch"
                );
            }
        }
    }

    async fn shutdown(&self, grace: Duration) {
        self.shutdown_token.cancel();
        // Dropping the sender closes the channel once the queue drains,
        // letting each worker's `recv` loop end on its own rather than
        // abandoning messages already enqueued.
        self.sender
            .lock()
            .expect("subscription sender lock poisoned")
            .take();
        let workers = {
            let mut guard = self
                .workers
                .lock()
                .expect("subscription workers lock poisoned");
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
                "subscription workers did not drain within the shutdown grace period"
            );
        }
    }
}

/// Spawn `options.worker_count` cooperative workers draining a fresh
/// unbounded queue, and return the type-erased handle the bus's routing
/// table stores.
pub(crate) fn spawn_subscription<E, H>(
    id: Uuid,
    routing_key: RoutingKey,
    resolver: Arc<dyn HandlerResolver<H>>,
    options: EventOptions,
    shutdown_token: CancellationToken,
) -> Arc<TypedSubscription<E>>
where
    E: Send + 'static,
    H: EventHandler<E> + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<E>();
    let receiver = Arc::new(tokio::sync::Mutex::new(rx));

    let worker_count = options.worker_count.max(1);
    let mut workers = Vec::with_capacity(worker_count);
    for worker_index in 0..worker_count {
        let receiver = Arc::clone(&receiver);
        let resolver = Arc::clone(&resolver);
        let routing_key = routing_key.clone();
        let shutdown_token = shutdown_token.clone();
        let timeout = options.timeout;
        let continue_on_error = options.continue_on_error;
        workers.push(tokio::spawn(async move {
            worker_loop::<E, H>(
                worker_index,
                receiver,
                resolver,
                routing_key,
                timeout,
                continue_on_error,
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
async fn worker_loop<E, H>(
    worker_index: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<E>>>,
    resolver: Arc<dyn HandlerResolver<H>>,
    routing_key: RoutingKey,
    timeout: Duration,
    continue_on_error: bool,
    shutdown_token: CancellationToken,
) where
    E: Send + 'static,
    H: EventHandler<E> + 'static,
{
    loop {
        let event = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(event) = event else {
            break;
        };

        let scoped = match resolver.resolve().await {
            Ok(scoped) => scoped,
            Err(err) => {
                warn!(routing_key = %routing_key, error = %err, "failed to resolve event handler");
                if continue_on_error {
                    continue;
                }
                break;
            }
        };

        let outcome = invoke_with_deadline(&shutdown_token, timeout, |cancel| async move {
            scoped.handle(event, cancel).await
        })
        .await;

        match outcome {
            InvocationOutcome::Completed(Ok(())) => {}
            InvocationOutcome::Completed(Err(err)) => {
                warn!(routing_key = %routing_key, error = %err, "event handler failed");
                if !continue_on_error {
                    break;
                }
            }
            InvocationOutcome::TimedOut => {
                warn!(
                    routing_key = %routing_key,
                    timeout_ms = timeout.as_millis() as u64,
                    "event handler timed out"
                );
                if !continue_on_error {
                    break;
                }
            }
            InvocationOutcome::Cancelled => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_core::SingletonResolver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler<u32> for CountingHandler {
        async fn handle(&self, _event: u32, _cancel: CancellationToken) -> kernel_core::KernelResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn fifo_within_a_single_worker_subscription() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = spawn_subscription::<u32, CountingHandler>(
            Uuid::new_v4(),
            RoutingKey::named("counter"),
            Arc::new(SingletonResolver::new(Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
            }))),
            EventOptions {
                worker_count: 1,
                ..EventOptions::default()
            },
            CancellationToken::new(),
        );

        for i in 0..5u32 {
            sub.enqueue(Box::new(i));
        }
        sub.shutdown(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn mismatched_payload_type_is_dropped_not_delivered() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = spawn_subscription::<u32, CountingHandler>(
            Uuid::new_v4(),
            RoutingKey::named("counter"),
            Arc::new(SingletonResolver::new(Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
            }))),
            EventOptions::default(),
            CancellationToken::new(),
        );

        sub.enqueue(Box::new("not a u32".to_string()));
        sub.shutdown(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
