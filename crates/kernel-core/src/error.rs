//! Error taxonomy shared by all three engines.
//!
//! One enum covers commands, events, and tasks rather than three near-
//! identical ones, since the propagation policy differs by *caller* rather
//! than by error shape.

use std::fmt;

/// Result alias used throughout the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

/// The kernel's error taxonomy.
///
/// `PayloadTypeMismatch` is intentionally never surfaced to a caller — it is
/// logged and dropped at the point a subscription rejects a payload whose
/// runtime type doesn't match its declared type. It exists in this enum
/// anyway so that internal call sites have a single
/// error type to thread through `Result`.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// No handler is registered for the request type.
    #[error("no handler registered for request type `{request_type}`")]
    NoHandler { request_type: &'static str },

    /// A second handler was registered for a request type that already has one.
    #[error("a handler is already registered for request type `{request_type}`")]
    DuplicateHandler { request_type: &'static str },

    /// The handler itself returned an error. The original cause is preserved.
    #[error("handler for `{source_type}` failed: {cause}")]
    HandlerError {
        source_type: &'static str,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// The per-invocation deadline elapsed before the handler returned.
    #[error("invocation of `{source_type}` timed out after {elapsed_ms}ms")]
    Timeout {
        source_type: &'static str,
        elapsed_ms: u64,
    },

    /// Shutdown or an external cancellation signal was observed.
    #[error("invocation of `{source_type}` was cancelled")]
    Cancelled { source_type: &'static str },

    /// `Enqueue` was called on a transaction that has already committed.
    #[error("cannot enqueue onto a transaction that has already committed")]
    TransactionCommitted,

    /// An operation was attempted on a transaction that has already been disposed.
    #[error("transaction has already been disposed")]
    TransactionDisposed,

    /// A payload's runtime type did not match the subscription's declared type.
    ///
    /// Never returned to a library caller; logged via `tracing::warn!` and
    /// dropped at the enqueue boundary.
    #[error("payload type mismatch for subscription on `{routing_key}`: expected `{expected}`")]
    PayloadTypeMismatch {
        routing_key: String,
        expected: &'static str,
    },
}

impl KernelError {
    /// Wrap an arbitrary handler error, preserving its `source_type` for logging.
    pub fn handler_error<E>(source_type: &'static str, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        KernelError::HandlerError {
            source_type,
            cause: Box::new(cause),
        }
    }

    /// Wrap an opaque, string-only handler failure (used by test doubles and
    /// the demo binary where a concrete `std::error::Error` is overkill).
    pub fn handler_message(source_type: &'static str, message: impl Into<String>) -> Self {
        KernelError::HandlerError {
            source_type,
            cause: Box::new(MessageError(message.into())),
        }
    }

    /// True if this error represents a cancellation (shutdown or timeout-driven).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, KernelError::Cancelled { .. } | KernelError::Timeout { .. })
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MessageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_message_round_trips_display() {
        let err = KernelError::handler_message("Echo", "boom");
        assert_eq!(err.to_string(), "handler for `Echo` failed: boom");
    }

    #[test]
    fn is_cancellation_covers_timeout_and_cancelled() {
        assert!(KernelError::Timeout {
            source_type: "T",
            elapsed_ms: 5
        }
        .is_cancellation());
        assert!(KernelError::Cancelled { source_type: "T" }.is_cancellation());
        assert!(!KernelError::NoHandler {
            request_type: "T"
        }
        .is_cancellation());
    }
}
