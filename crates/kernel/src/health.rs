//! Read-only introspection snapshot: active task counts and subscription
//! counts across the three engines. Not a persisted or exported metrics
//! pipeline — a host that wants Prometheus/OpenTelemetry export reads this
//! and forwards it itself.

/// A point-in-time snapshot returned by [`crate::Kernel::health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelHealth {
    /// Number of request types with a registered command handler.
    pub registered_commands: usize,
    /// Number of live event subscriptions across every routing key.
    pub event_subscriptions: usize,
    /// Number of task types with a live subscription.
    pub task_subscriptions: usize,
    /// Tasks currently `Pending` or `Processing`.
    pub active_tasks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_fields_are_plain_counts() {
        let snapshot = KernelHealth {
            registered_commands: 2,
            event_subscriptions: 3,
            task_subscriptions: 1,
            active_tasks: 5,
        };
        assert_eq!(snapshot.registered_commands, 2);
        assert_eq!(snapshot.active_tasks, 5);
    }
}
