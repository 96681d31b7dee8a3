//! Per-subscription tuning knobs.

use std::time::Duration;

use kernel_core::config::EventDefaults;

/// Options governing a single event subscription's worker pool and policy.
#[derive(Debug, Clone, PartialEq)]
pub struct EventOptions {
    /// Number of cooperative workers draining the subscription's queue.
    pub worker_count: usize,
    /// Per-invocation deadline.
    pub timeout: Duration,
    /// Whether a handler failure (including timeout) stops the worker loop.
    pub continue_on_error: bool,
}

impl Default for EventOptions {
    fn default() -> Self {
        EventOptions {
            worker_count: 10,
            timeout: Duration::from_secs(30),
            continue_on_error: true,
        }
    }
}

impl From<&EventDefaults> for EventOptions {
    fn from(defaults: &EventDefaults) -> Self {
        EventOptions {
            worker_count: defaults.worker_count,
            timeout: defaults.timeout,
            continue_on_error: defaults.continue_on_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_options_table_in_the_spec() {
        let options = EventOptions::default();
        assert_eq!(options.worker_count, 10);
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert!(options.continue_on_error);
    }

    #[test]
    fn builds_from_kernel_config_defaults() {
        let defaults = EventDefaults::default();
        let options = EventOptions::from(&defaults);
        assert_eq!(options.worker_count, defaults.worker_count);
        assert_eq!(options.timeout, defaults.timeout);
    }
}
