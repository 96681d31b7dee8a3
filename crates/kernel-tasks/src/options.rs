//! Per-subscription tuning knobs for task subscriptions (`spec.md` §3
//! "Subscription", §6 Options table).

use std::time::Duration;

use kernel_core::config::TaskDefaults;

use crate::step::ProgressStep;

/// Options governing a single task subscription's worker pool, retry
/// policy, and optional progress plan.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub worker_count: usize,
    pub timeout: Duration,
    pub continue_on_error: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// A step plan for smooth progress reporting; `None` means the handler
    /// drives progress entirely through `SetProgress`.
    pub progress_steps: Option<Vec<ProgressStep>>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        TaskOptions {
            worker_count: 10,
            timeout: Duration::from_secs(5 * 60),
            continue_on_error: true,
            max_retries: 0,
            retry_delay: Duration::from_secs(5),
            progress_steps: None,
        }
    }
}

impl TaskOptions {
    /// Build default options with no progress plan (`spec.md` §6: `10`
    /// workers, `5 min` timeout, `continueOnError = true`, `maxRetries = 0`,
    /// `retryDelay = 5s`).
    pub fn from_defaults(defaults: &TaskDefaults) -> Self {
        TaskOptions {
            worker_count: defaults.worker_count,
            timeout: defaults.timeout,
            continue_on_error: defaults.continue_on_error,
            max_retries: defaults.max_retries,
            retry_delay: defaults.retry_delay,
            progress_steps: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_options_table_in_the_spec() {
        let options = TaskOptions::from_defaults(&TaskDefaults::default());
        assert_eq!(options.worker_count, 10);
        assert_eq!(options.timeout, Duration::from_secs(5 * 60));
        assert!(options.continue_on_error);
        assert_eq!(options.max_retries, 0);
        assert_eq!(options.retry_delay, Duration::from_secs(5));
        assert!(options.progress_steps.is_none());
    }
}
