//! Accumulates events and publishes them strictly sequentially on commit.

use std::sync::{Arc, Mutex};

use kernel_core::{KernelError, KernelResult, RoutingKey};
use tokio::task::JoinHandle;

use crate::bus::EventBus;

/// Lifecycle of an [`EventTransaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    Completed,
}

type PublishFn = Box<dyn FnOnce(&EventBus) + Send>;

/// An ordered batch of pending publishes that commits in insertion order.
///
/// The baseline sequential guarantee is publish-order serialisation: event
/// *k+1* is published only after event *k*'s publish step has returned and a
/// deterministic yield has elapsed. This does not wait for subscribers to
/// finish *handling* event *k* — a stronger guarantee requiring a drain hook
/// per publish, which this implementation does not provide.
pub struct EventTransaction {
    bus: Arc<EventBus>,
    state: Arc<Mutex<TransactionState>>,
    pending: Mutex<Vec<PublishFn>>,
    completion: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EventTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTransaction")
            .field(
                "state",
                &*self.state.lock().expect("transaction state lock poisoned"),
            )
            .field(
                "pending",
                &self
                    .pending
                    .lock()
                    .expect("transaction pending lock poisoned")
                    .len(),
            )
            .finish()
    }
}

impl EventTransaction {
    pub(crate) fn new(bus: Arc<EventBus>) -> Self {
        EventTransaction {
            bus,
            state: Arc::new(Mutex::new(TransactionState::Open)),
            pending: Mutex::new(Vec::new()),
            completion: Mutex::new(None),
        }
    }

    /// The transaction's current lifecycle state.
    pub fn state(&self) -> TransactionState {
        *self.state.lock().expect("transaction state lock poisoned")
    }

    /// `Enqueue(e)`: routing key is `E`'s type name.
    pub fn enqueue<E>(&self, event: E) -> KernelResult<()>
    where
        E: Clone + Send + Sync + 'static,
    {
        self.enqueue_key(RoutingKey::of::<E>(), event)
    }

    /// `Enqueue(name, e)`: an explicit routing key.
    pub fn enqueue_named<E>(&self, name: impl Into<String>, event: E) -> KernelResult<()>
    where
        E: Clone + Send + Sync + 'static,
    {
        self.enqueue_key(RoutingKey::named(name.into()), event)
    }

    fn enqueue_key<E>(&self, key: RoutingKey, event: E) -> KernelResult<()>
    where
        E: Clone + Send + Sync + 'static,
    {
        if self.state() != TransactionState::Open {
            return Err(KernelError::TransactionCommitted);
        }
        let mut pending = self
            .pending
            .lock()
            .expect("transaction pending lock poisoned");
        pending.push(Box::new(move |bus: &EventBus| {
            bus.publish_key(key, event);
        }));
        Ok(())
    }

    /// `Commit()`: snapshot the queued events and schedule their sequential
    /// publication on a background task; returns a handle awaited by
    /// [`EventTransaction::wait_for_completion`].
    pub fn commit(&self) -> KernelResult<()> {
        {
            let mut state = self
                .state
                .lock()
                .expect("transaction state lock poisoned");
            match *state {
                TransactionState::Open => *state = TransactionState::Committed,
                TransactionState::Committed | TransactionState::Completed => {
                    return Err(KernelError::TransactionCommitted)
                }
            }
        }
        let pending = {
            let mut pending = self
                .pending
                .lock()
                .expect("transaction pending lock poisoned");
            std::mem::take(&mut *pending)
        };
        let handle = spawn_sequential_publish(Arc::clone(&self.bus), Arc::clone(&self.state), pending);
        *self
            .completion
            .lock()
            .expect("transaction completion lock poisoned") = Some(handle);
        Ok(())
    }

    /// `WaitForCompletion()`: await the handle `commit` scheduled. A no-op
    /// if the completion has already been awaited, or the transaction was
    /// never committed.
    pub async fn wait_for_completion(&self) -> KernelResult<()> {
        let handle = self
            .completion
            .lock()
            .expect("transaction completion lock poisoned")
            .take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|err| KernelError::handler_message("EventTransaction", err.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for EventTransaction {
    fn drop(&mut self) {
        let should_commit = {
            let state = self.state.lock().expect("transaction state lock poisoned");
            *state == TransactionState::Open
        };
        if !should_commit {
            return;
        }
        let pending = {
            let mut pending = self
                .pending
                .lock()
                .expect("transaction pending lock poisoned");
            std::mem::take(&mut *pending)
        };
        if pending.is_empty() {
            return;
        }
        *self.state.lock().expect("transaction state lock poisoned") = TransactionState::Committed;
        spawn_sequential_publish(Arc::clone(&self.bus), Arc::clone(&self.state), pending);
    }
}

fn spawn_sequential_publish(
    bus: Arc<EventBus>,
    state: Arc<Mutex<TransactionState>>,
    pending: Vec<PublishFn>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for publish in pending {
            publish(&bus);
            // The minimal inter-event ordering barrier, short of a full
            // subscriber-drain wait.
            tokio::task::yield_now().await;
        }
        *state.lock().expect("transaction state lock poisoned") = TransactionState::Completed;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::EventHandler;
    use crate::options::EventOptions;
    use async_trait::async_trait;
    use kernel_core::SingletonResolver;
    use std::sync::Mutex as StdMutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Clone)]
    struct Seq(i32);

    struct Recorder {
        seen: Arc<StdMutex<Vec<i32>>>,
    }

    #[async_trait]
    impl EventHandler<Seq> for Recorder {
        async fn handle(&self, event: Seq, _cancel: CancellationToken) -> KernelResult<()> {
            self.seen.lock().unwrap().push(event.0);
            Ok(())
        }
    }

    #[tokio::test]
    async fn transaction_publishes_in_insertion_order() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe::<Seq, _>(
            Arc::new(SingletonResolver::new(Arc::new(Recorder {
                seen: Arc::clone(&seen),
            }))),
            EventOptions {
                worker_count: 1,
                ..EventOptions::default()
            },
        );

        let txn = bus.create_transaction();
        txn.enqueue(Seq(1)).unwrap();
        txn.enqueue(Seq(2)).unwrap();
        txn.enqueue(Seq(3)).unwrap();
        txn.commit().unwrap();
        txn.wait_for_completion().await.unwrap();

        // Give the single worker a moment to drain the now-published queue.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn enqueue_after_commit_fails_with_transaction_committed() {
        let bus = Arc::new(EventBus::new());
        let txn = bus.create_transaction();
        txn.enqueue(Seq(1)).unwrap();
        txn.commit().unwrap();

        let err = txn.enqueue(Seq(2)).unwrap_err();
        assert!(matches!(err, KernelError::TransactionCommitted));
    }

    #[tokio::test]
    async fn second_commit_fails_with_transaction_committed() {
        let bus = Arc::new(EventBus::new());
        let txn = bus.create_transaction();
        txn.enqueue(Seq(1)).unwrap();
        txn.commit().unwrap();
        let err = txn.commit().unwrap_err();
        assert!(matches!(err, KernelError::TransactionCommitted));
    }

    #[tokio::test]
    async fn dropping_an_uncommitted_nonempty_transaction_commits_it() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe::<Seq, _>(
            Arc::new(SingletonResolver::new(Arc::new(Recorder {
                seen: Arc::clone(&seen),
            }))),
            EventOptions {
                worker_count: 1,
                ..EventOptions::default()
            },
        );

        {
            let txn = bus.create_transaction();
            txn.enqueue(Seq(1)).unwrap();
            txn.enqueue(Seq(2)).unwrap();
        } // dropped without an explicit commit

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }
}
