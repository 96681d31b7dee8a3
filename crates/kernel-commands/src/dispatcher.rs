//! Routes `Request -> Response` to the one registered handler.
//!
//! Generic dispatch is erased behind a boxed `Any` payload at registration
//! time so the routing table itself can be a single, non-generic `DashMap`.

use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kernel_core::{HandlerResolver, KernelError, KernelResult};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::handler::CommandHandler;
use crate::request::Request;

type AnyBox = Box<dyn Any + Send>;

#[async_trait]
trait ErasedCommandHandler: Send + Sync {
    async fn dispatch(&self, request: AnyBox, cancel: CancellationToken) -> KernelResult<AnyBox>;
}

struct TypedCommandHandler<R, H> {
    resolver: Arc<dyn HandlerResolver<H>>,
    _marker: PhantomData<fn() -> R>,
}

#[async_trait]
impl<R, H> ErasedCommandHandler for TypedCommandHandler<R, H>
where
    R: Request,
    H: CommandHandler<R> + 'static,
{
    async fn dispatch(&self, request: AnyBox, cancel: CancellationToken) -> KernelResult<AnyBox> {
        let request = *request
            .downcast::<R>()
            .expect("registry guarantees the payload matches the registered request type");
        let scoped = self.resolver.resolve().await?;
        let response = scoped.handle(request, cancel).await?;
        Ok(Box::new(response) as AnyBox)
    }
}

/// Resolution table mapping each concrete request type to its one handler.
pub struct CommandDispatcher {
    handlers: DashMap<TypeId, (&'static str, Arc<dyn ErasedCommandHandler>)>,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("registered_handlers", &self.handlers.len())
            .finish()
    }
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDispatcher {
    pub fn new() -> Self {
        CommandDispatcher {
            handlers: DashMap::new(),
        }
    }

    /// Number of request types with a registered handler, for introspection
    /// (e.g. a host's health snapshot).
    pub fn registered_handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Register the one handler for request type `R`. A second registration
    /// for the same `R` fails with [`KernelError::DuplicateHandler`].
    pub fn register<R, H>(&self, resolver: Arc<dyn HandlerResolver<H>>) -> KernelResult<()>
    where
        R: Request,
        H: CommandHandler<R> + 'static,
    {
        let type_id = TypeId::of::<R>();
        let type_name = std::any::type_name::<R>();
        match self.handlers.entry(type_id) {
            Entry::Occupied(_) => Err(KernelError::DuplicateHandler {
                request_type: type_name,
            }),
            Entry::Vacant(slot) => {
                let typed: TypedCommandHandler<R, H> = TypedCommandHandler {
                    resolver,
                    _marker: PhantomData,
                };
                slot.insert((type_name, Arc::new(typed)));
                Ok(())
            }
        }
    }

    /// `Send<R>(req): R::Response`, with no external cancellation signal.
    pub async fn send<R: Request>(&self, request: R) -> KernelResult<R::Response> {
        self.send_with_cancel(request, CancellationToken::new())
            .await
    }

    /// `Send<R>(req): R::Response`, racing the handler against `cancel`.
    ///
    /// Whichever of "handler completes" or "`cancel` fires" happens first
    /// determines the outcome.
    #[instrument(skip(self, request, cancel), fields(request_type = std::any::type_name::<R>()))]
    pub async fn send_with_cancel<R: Request>(
        &self,
        request: R,
        cancel: CancellationToken,
    ) -> KernelResult<R::Response> {
        let type_id = TypeId::of::<R>();
        let type_name = std::any::type_name::<R>();

        let handler = {
            let entry = self
                .handlers
                .get(&type_id)
                .ok_or(KernelError::NoHandler {
                    request_type: type_name,
                })?;
            Arc::clone(&entry.value().1)
        };

        let boxed_request: AnyBox = Box::new(request);
        let child_cancel = cancel.child_token();

        let boxed_response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(KernelError::Cancelled { source_type: type_name });
            }
            result = handler.dispatch(boxed_request, child_cancel) => result?,
        };

        Ok(*boxed_response
            .downcast::<R::Response>()
            .expect("registry guarantees the response matches the registered response type"))
    }
}
