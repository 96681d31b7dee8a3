//! Clock abstraction, one of the external collaborators the core consumes
//! instead of calling `Utc::now()` at call sites.
//!
//! Tests substitute `FrozenClock` to make timestamp- and duration-dependent
//! assertions (e.g. `Duration = CompletedAt - StartedAt`) deterministic
//! without reaching for `tokio::time::pause` everywhere.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// Supplies the current wall-clock time to the engines.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock whose value is set explicitly, for deterministic tests.
#[derive(Debug)]
pub struct FrozenClock {
    millis_since_epoch: AtomicI64,
}

impl FrozenClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        FrozenClock {
            millis_since_epoch: AtomicI64::new(at.timestamp_millis()),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        self.millis_since_epoch
            .fetch_add(delta.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for FrozenClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis_since_epoch.load(Ordering::SeqCst))
            .expect("frozen clock millis always in range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_clock_advances_by_delta() {
        let start = Utc::now();
        let clock = FrozenClock::new(start);
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(30));
    }
}
