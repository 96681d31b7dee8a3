//! Time-based smooth progress reporting (`spec.md` §4.H "Progress Context").
//!
//! The source uses a reentrant timer with try-lock; the language-neutral
//! strategy from the specification's design notes is "a single dedicated
//! ticker ... per `ProgressContext` that reads the shared step state under
//! a mutex and emits via a callback". That is exactly what this module does,
//! using `tokio::time::Instant`/`interval` so that `tokio::time::pause` makes
//! the smoothing deterministic in tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::step::{ProgressPlan, ProgressStep};

/// An emitted progress update, passed to the context's `on_update` callback.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub percent: u8,
    /// 1-based; `None` when the context has no step plan.
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub message: Option<String>,
}

struct Inner {
    plan: ProgressPlan,
    /// `None` before the first `Next`/`GoTo` call: no step is active yet and
    /// the reported percent is 0 (`spec.md` §8 scenario 6: "starts at 0").
    current_step: Option<usize>,
    step_started_at: Instant,
    message: Option<String>,
    manual_override: Option<u8>,
    last_emitted_percent: Option<u8>,
}

impl Inner {
    fn compute_percent(&self) -> u8 {
        if let Some(p) = self.manual_override {
            return p;
        }
        let Some(step) = self.current_step else {
            return 0;
        };
        if self.plan.is_empty() {
            return 0;
        }
        let entry = &self.plan.entries[step];
        let percent = if entry.duration.is_zero() {
            entry.end_percent.floor()
        } else {
            let elapsed = self.step_started_at.elapsed().as_secs_f64();
            let frac = (elapsed / entry.duration.as_secs_f64()).min(0.99);
            (entry.start_percent + (entry.end_percent - entry.start_percent) * frac).floor()
        };
        percent.clamp(0.0, 100.0) as u8
    }

    fn current_message(&self) -> Option<String> {
        self.message.clone().or_else(|| {
            self.current_step
                .and_then(|i| self.plan.entries.get(i))
                .and_then(|e| e.message.clone())
        })
    }

    fn snapshot(&self) -> ProgressUpdate {
        ProgressUpdate {
            percent: self.compute_percent(),
            current_step: if self.plan.is_empty() {
                None
            } else {
                self.current_step.map(|i| i as u32 + 1)
            },
            total_steps: if self.plan.is_empty() {
                None
            } else {
                Some(self.plan.len() as u32)
            },
            message: self.current_message(),
        }
    }
}

/// A per-task handle through which a task handler advances steps; a
/// smoothing timer interpolates percent between step boundaries and emits
/// at most one update per `tick_interval` when the percent has changed,
/// plus one immediate emission per explicit operation.
pub struct ProgressContext {
    inner: Mutex<Inner>,
    on_update: Arc<dyn Fn(ProgressUpdate) + Send + Sync>,
    stop: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProgressContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressContext").finish_non_exhaustive()
    }
}

impl ProgressContext {
    /// Build a context over `steps` (empty for "no plan") and start its
    /// ticker, emitting through `on_update` every time the computed percent
    /// changes.
    pub fn new(
        steps: Vec<ProgressStep>,
        tick_interval: Duration,
        on_update: Arc<dyn Fn(ProgressUpdate) + Send + Sync>,
    ) -> Arc<Self> {
        let plan = ProgressPlan::new(&steps);
        let inner = Mutex::new(Inner {
            plan,
            current_step: None,
            step_started_at: Instant::now(),
            message: None,
            manual_override: None,
            last_emitted_percent: None,
        });

        let context = Arc::new(ProgressContext {
            inner,
            on_update,
            stop: CancellationToken::new(),
            ticker: Mutex::new(None),
        });

        let ticker_context = Arc::clone(&context);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.tick().await; // first tick fires immediately; discard it
            loop {
                tokio::select! {
                    _ = ticker_context.stop.cancelled() => break,
                    _ = interval.tick() => ticker_context.emit_if_changed(),
                }
            }
        });
        *context.ticker.lock().expect("progress ticker lock poisoned") = Some(handle);

        context
    }

    fn emit_if_changed(&self) {
        let mut inner = self.inner.lock().expect("progress context lock poisoned");
        let update = inner.snapshot();
        if inner.last_emitted_percent != Some(update.percent) {
            inner.last_emitted_percent = Some(update.percent);
            drop(inner);
            self.emit(update);
        }
    }

    fn emit_explicit(&self, inner: &mut Inner) {
        let update = inner.snapshot();
        inner.last_emitted_percent = Some(update.percent);
        self.emit(update);
    }

    fn emit(&self, update: ProgressUpdate) {
        (self.on_update)(update);
    }

    /// `Next(message?)`: advance to the next step, restart the step clock,
    /// and emit the recomputed percent immediately.
    pub fn next(&self, message: Option<String>) {
        let mut inner = self.inner.lock().expect("progress context lock poisoned");
        if inner.plan.is_empty() {
            return;
        }
        inner.current_step = Some(match inner.current_step {
            None => 0,
            Some(i) if i + 1 < inner.plan.len() => i + 1,
            Some(i) => i,
        });
        inner.step_started_at = Instant::now();
        inner.manual_override = None;
        inner.message = message;
        self.emit_explicit(&mut inner);
    }

    /// `GoTo(i, message?)`: jump to step `i`, ignored if out of range.
    pub fn go_to(&self, step: usize, message: Option<String>) {
        let mut inner = self.inner.lock().expect("progress context lock poisoned");
        if step >= inner.plan.len() {
            return;
        }
        inner.current_step = Some(step);
        inner.step_started_at = Instant::now();
        inner.manual_override = None;
        inner.message = message;
        self.emit_explicit(&mut inner);
    }

    /// `SetMessage(m)`: update the message only; percent is recomputed but
    /// the step is unchanged.
    pub fn set_message(&self, message: impl Into<String>) {
        let mut inner = self.inner.lock().expect("progress context lock poisoned");
        inner.message = Some(message.into());
        self.emit_explicit(&mut inner);
    }

    /// `SetProgress(p, message?)`: override the interpolated percent,
    /// bypassing the plan (used when there is no step plan).
    pub fn set_progress(&self, percent: u8, message: Option<String>) {
        let mut inner = self.inner.lock().expect("progress context lock poisoned");
        inner.manual_override = Some(percent.min(100));
        if message.is_some() {
            inner.message = message;
        }
        self.emit_explicit(&mut inner);
    }

    /// A read-only snapshot, for tests and introspection.
    pub fn snapshot(&self) -> ProgressUpdate {
        self.inner
            .lock()
            .expect("progress context lock poisoned")
            .snapshot()
    }

    /// Stop the ticker. Idempotent; the final terminal `TaskState`
    /// transition is emitted by the state store, not the context
    /// (`spec.md` §4.H "Thread-safety"). Does not wait for the ticker to
    /// actually exit — a racing in-flight tick can still call `on_update`
    /// after this returns. Callers that are about to record a terminal
    /// `TaskState` transition for the same task must use
    /// [`ProgressContext::dispose_and_wait`] instead, or per-`TaskId`
    /// notification ordering (`spec.md` §4.I "Ordering of notifications")
    /// is not guaranteed.
    pub fn dispose(&self) {
        self.stop.cancel();
    }

    /// Stop the ticker and wait for its task to fully exit before
    /// returning. Because the ticker only ever calls `on_update` from
    /// inside its own task and never across an `.await` once a tick fires,
    /// awaiting its `JoinHandle` guarantees no further emission can happen
    /// after this call returns — callers use this immediately before
    /// recording a terminal `TaskState` transition so that a stale
    /// in-progress update can never be observed after the terminal one.
    /// Idempotent: a second call is a no-op since the handle is only taken
    /// once.
    pub async fn dispose_and_wait(&self) {
        self.stop.cancel();
        let handle = {
            let mut ticker = self.ticker.lock().expect("progress ticker lock poisoned");
            ticker.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressContext {
    fn drop(&mut self) {
        self.dispose();
    }
}
