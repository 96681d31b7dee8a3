//! Composed cancellation for a single handler invocation.
//!
//! Every handler receives a cancellation token composed from two sources:
//! `shutdown ∪ per-call deadline`. Both the events worker loop and the tasks
//! worker loop need exactly this composition, so it lives here rather than
//! being duplicated.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// How a single invocation ended.
#[derive(Debug)]
pub enum InvocationOutcome<T> {
    /// The handler future resolved before the deadline or shutdown fired.
    Completed(T),
    /// The per-invocation deadline elapsed first.
    TimedOut,
    /// `shutdown` fired before the handler completed or the deadline elapsed.
    Cancelled,
}

/// Run `fut` under a deadline, composed with `shutdown`. The token passed to
/// `fut` (via its caller) should be the returned child token, so a
/// cooperative handler observes cancellation from either source.
pub async fn invoke_with_deadline<F, T>(
    shutdown: &CancellationToken,
    timeout: Duration,
    make_future: impl FnOnce(CancellationToken) -> F,
) -> InvocationOutcome<T>
where
    F: Future<Output = T>,
{
    let call_cancel = shutdown.child_token();
    let fut = make_future(call_cancel.clone());
    tokio::pin!(fut);
    let sleep = tokio::time::sleep(timeout);
    tokio::pin!(sleep);

    tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            call_cancel.cancel();
            InvocationOutcome::Cancelled
        }
        _ = &mut sleep => {
            call_cancel.cancel();
            InvocationOutcome::TimedOut
        }
        result = &mut fut => InvocationOutcome::Completed(result),
    }
}
