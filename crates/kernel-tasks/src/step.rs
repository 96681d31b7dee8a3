//! `ProgressStep` and the precomputed plan it forms.

use std::time::Duration;

/// One step of a task's progress plan: an estimated duration plus an
/// optional default message shown while the step is active.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressStep {
    pub estimated_duration: Duration,
    pub message: Option<String>,
}

impl ProgressStep {
    pub fn new(estimated_duration: Duration) -> Self {
        ProgressStep {
            estimated_duration,
            message: None,
        }
    }

    pub fn with_message(estimated_duration: Duration, message: impl Into<String>) -> Self {
        ProgressStep {
            estimated_duration,
            message: Some(message.into()),
        }
    }
}

/// One precomputed plan entry: the `[start, end]` percent range a step
/// occupies plus its estimated duration and default message.
#[derive(Debug, Clone)]
pub(crate) struct PlanEntry {
    pub start_percent: f64,
    pub end_percent: f64,
    pub duration: Duration,
    pub message: Option<String>,
}

/// A precomputed, ordered sequence of step endpoints.
///
/// Given step durations `d_0..d_{n-1}`: if their sum is zero, each step is
/// partitioned equally (`end_i = (i+1) * 100/n`); otherwise `end_i` is the
/// cumulative fraction of total estimated duration.
#[derive(Debug, Clone)]
pub(crate) struct ProgressPlan {
    pub entries: Vec<PlanEntry>,
}

impl ProgressPlan {
    pub fn new(steps: &[ProgressStep]) -> Self {
        let n = steps.len();
        if n == 0 {
            return ProgressPlan {
                entries: Vec::new(),
            };
        }

        let total: Duration = steps.iter().map(|s| s.estimated_duration).sum();
        let mut entries = Vec::with_capacity(n);
        let mut start = 0.0f64;
        let mut cumulative = Duration::ZERO;

        for (i, step) in steps.iter().enumerate() {
            let end = if total.is_zero() {
                (i as f64 + 1.0) * (100.0 / n as f64)
            } else {
                cumulative += step.estimated_duration;
                100.0 * cumulative.as_secs_f64() / total.as_secs_f64()
            };
            entries.push(PlanEntry {
                start_percent: start,
                end_percent: end,
                duration: step.estimated_duration,
                message: step.message.clone(),
            });
            start = end;
        }

        ProgressPlan { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_partition_when_total_duration_is_zero() {
        let steps = vec![
            ProgressStep::new(Duration::ZERO),
            ProgressStep::new(Duration::ZERO),
            ProgressStep::new(Duration::ZERO),
        ];
        let plan = ProgressPlan::new(&steps);
        let ends: Vec<f64> = plan.entries.iter().map(|e| e.end_percent).collect();
        assert!((ends[0] - 100.0 / 3.0).abs() < 1e-9);
        assert!((ends[1] - 200.0 / 3.0).abs() < 1e-9);
        assert!((ends[2] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn proportional_to_duration_when_total_is_nonzero() {
        let steps = vec![
            ProgressStep::new(Duration::from_millis(100)),
            ProgressStep::new(Duration::from_millis(300)),
        ];
        let plan = ProgressPlan::new(&steps);
        assert!((plan.entries[0].end_percent - 25.0).abs() < 1e-9);
        assert!((plan.entries[1].end_percent - 100.0).abs() < 1e-9);
        assert_eq!(plan.entries[1].start_percent, plan.entries[0].end_percent);
    }

    #[test]
    fn empty_plan_has_no_entries() {
        let plan = ProgressPlan::new(&[]);
        assert!(plan.is_empty());
        assert_eq!(plan.len(), 0);
    }
}
