//! Demonstrates all three engines behind the `Kernel` facade: a command
//! with one typed handler, an event fanned out to two subscribers, and a
//! task with a step plan and one retried attempt.
//!
//! Not part of the library's public contract — a host embeds `kernel`
//! directly rather than shelling out to this binary.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kernel::{
    CommandHandler, EventHandler, ExtensionId, KernelBuilder, KernelError, KernelResult,
    ProgressStep, Request, SingletonResolver, TaskHandler, TaskPayload, TaskStatus,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct AddRequest {
    left: i64,
    right: i64,
}

impl Request for AddRequest {
    type Response = i64;
}

#[derive(Debug)]
struct AddHandler;

#[async_trait]
impl CommandHandler<AddRequest> for AddHandler {
    async fn handle(&self, request: AddRequest, _cancel: CancellationToken) -> KernelResult<i64> {
        Ok(request.left + request.right)
    }
}

#[derive(Debug, Clone)]
struct OrderPlaced {
    order_id: u32,
}

#[derive(Debug)]
struct EmailNotifier;

#[async_trait]
impl EventHandler<OrderPlaced> for EmailNotifier {
    async fn handle(&self, event: OrderPlaced, _cancel: CancellationToken) -> KernelResult<()> {
        tracing::info!(order_id = event.order_id, "sending confirmation email");
        Ok(())
    }
}

#[derive(Debug)]
struct InventoryReserver;

#[async_trait]
impl EventHandler<OrderPlaced> for InventoryReserver {
    async fn handle(&self, event: OrderPlaced, _cancel: CancellationToken) -> KernelResult<()> {
        tracing::info!(order_id = event.order_id, "reserving inventory");
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct GenerateReport {
    report_name: String,
}

/// Fails its first attempt, succeeds on the second — demonstrates the
/// retry-then-succeed scenario from `spec.md` §8.
#[derive(Debug)]
struct ReportGenerator {
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl TaskHandler<GenerateReport> for ReportGenerator {
    async fn handle(&self, payload: TaskPayload<GenerateReport>) -> KernelResult<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);

        payload.progress.next(Some("collecting rows".to_string()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        if attempt == 0 {
            return Err(KernelError::handler_message(
                "GenerateReport",
                "transient database timeout",
            ));
        }

        payload.progress.next(Some("rendering pdf".to_string()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        tracing::info!(report = %payload.data.report_name, "report generated");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("basic_usage=info".parse()?))
        .init();

    let kernel = KernelBuilder::new().build();

    // Commands: exactly one handler per request type.
    kernel.register_command::<AddRequest, _>(Arc::new(SingletonResolver::new(Arc::new(AddHandler))))?;
    let sum = kernel.send(AddRequest { left: 2, right: 40 }).await?;
    tracing::info!(sum, "command dispatched");

    // Events: fan-out to every subscriber.
    kernel.subscribe_event::<OrderPlaced, _>(
        Arc::new(SingletonResolver::new(Arc::new(EmailNotifier))),
        None,
    );
    kernel.subscribe_event::<OrderPlaced, _>(
        Arc::new(SingletonResolver::new(Arc::new(InventoryReserver))),
        None,
    );
    kernel.publish_event(OrderPlaced { order_id: 1001 });

    // Tasks: a step plan, a retry, and an observer watching for completion.
    let attempts = Arc::new(AtomicU32::new(0));
    kernel.subscribe_task::<GenerateReport, _>(
        Arc::new(SingletonResolver::new(Arc::new(ReportGenerator {
            attempts: Arc::clone(&attempts),
        }))),
        Some(kernel::TaskOptions {
            max_retries: 1,
            retry_delay: Duration::from_millis(10),
            progress_steps: Some(vec![
                ProgressStep::with_message(Duration::from_millis(50), "collecting rows"),
                ProgressStep::with_message(Duration::from_millis(50), "rendering pdf"),
            ]),
            ..kernel::TaskOptions::default()
        }),
    );

    let tenant = ExtensionId::new("acme-corp");
    let _watch = kernel.on_change_for_extension(tenant.clone(), |state| {
        tracing::info!(
            task_id = %state.task_id,
            status = ?state.status,
            progress = ?state.progress,
            "report task state changed"
        );
    });

    let task_id = kernel.publish_task(
        GenerateReport {
            report_name: "monthly-revenue".to_string(),
        },
        Some(tenant),
    )?;

    // Give the in-process worker pools a moment to drain before shutdown.
    tokio::time::sleep(Duration::from_millis(500)).await;

    if let Some(state) = kernel.get_task_state(task_id) {
        assert_eq!(state.status, TaskStatus::Completed);
        tracing::info!(status = ?state.status, progress = ?state.progress, "final task state");
    }

    tracing::info!(health = ?kernel.health(), "kernel health snapshot");
    kernel.shutdown(Duration::from_secs(2)).await;
    Ok(())
}
