//! The handler resolver contract: given a type key, produce a fresh handler
//! instance within a disposable scope.
//!
//! This is expressed as a trait generic over the handler type; "disposable
//! scope" becomes RAII: the scope closes when `ScopedHandler` drops, on
//! every exit path including an unwinding panic, which is strictly stronger
//! than an explicit `dispose()` call that a caller could forget to await.

use std::any::Any;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::KernelResult;

/// Given a handler type `H`, produces a fresh instance plus whatever scope
/// that instance needs to stay alive (a connection, a borrowed allocator,
/// anything the host's DI container would otherwise track). The kernel
/// never inspects the scope; it only holds it until the call completes.
#[async_trait]
pub trait HandlerResolver<H: ?Sized>: Send + Sync {
    async fn resolve(&self) -> KernelResult<ScopedHandler<H>>;
}

/// A handler instance bound to a scope. Dropping this drops the scope.
pub struct ScopedHandler<H: ?Sized> {
    handler: Arc<H>,
    scope: Option<Box<dyn Any + Send>>,
}

impl<H: ?Sized> ScopedHandler<H> {
    /// Wrap a handler with no scope to dispose (e.g. a `'static` singleton).
    pub fn unscoped(handler: Arc<H>) -> Self {
        ScopedHandler {
            handler,
            scope: None,
        }
    }

    /// Wrap a handler together with a scope guard whose `Drop` impl performs
    /// the disposal (closing a connection, returning a pooled resource, …).
    pub fn with_scope<S: Send + 'static>(handler: Arc<H>, scope: S) -> Self {
        ScopedHandler {
            handler,
            scope: Some(Box::new(scope)),
        }
    }

    pub fn handler(&self) -> Arc<H> {
        Arc::clone(&self.handler)
    }
}

impl<H: ?Sized> Deref for ScopedHandler<H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.handler
    }
}

impl<H: ?Sized + std::fmt::Debug> std::fmt::Debug for ScopedHandler<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedHandler")
            .field("handler", &self.handler)
            .field("has_scope", &self.scope.is_some())
            .finish()
    }
}

/// A resolver that always hands out the same `Arc<H>`, with no scope to
/// dispose. Useful for stateless handlers and in tests.
#[derive(Debug)]
pub struct SingletonResolver<H: ?Sized> {
    handler: Arc<H>,
}

impl<H: ?Sized> SingletonResolver<H> {
    pub fn new(handler: Arc<H>) -> Self {
        SingletonResolver { handler }
    }
}

#[async_trait]
impl<H: ?Sized + Send + Sync> HandlerResolver<H> for SingletonResolver<H> {
    async fn resolve(&self) -> KernelResult<ScopedHandler<H>> {
        Ok(ScopedHandler::unscoped(Arc::clone(&self.handler)))
    }
}
