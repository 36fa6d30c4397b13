use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tracing::Instrument;

use crate::scheduler::{Envelope, TaskHandler, TaskOutcome};

/// Result of running one task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub envelope: Envelope,
    pub outcome: TaskOutcome,
}

/// Shared, read-only context for all workers.
pub struct WorkerContext {
    pub handler: Arc<dyn TaskHandler>,

    /// Reports from workers to the scheduler loop.
    pub report_tx: mpsc::UnboundedSender<TaskReport>,

    /// Wakes the scheduler loop.
    pub notify: Arc<Notify>,
}

/// Main worker loop.
///
/// Each worker pulls envelopes from the shared ready queue, runs them and
/// reports the outcome back. Retries are never slept on inside a worker.
pub async fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<Envelope>>>, ctx: Arc<WorkerContext>) {
    loop {
        let envelope = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        let Some(envelope) = envelope else { break };

        let report = process_task(envelope, &ctx).await;
        if ctx.report_tx.send(report).is_err() {
            break;
        }
        ctx.notify.notify_one();
    }
}

async fn process_task(envelope: Envelope, ctx: &WorkerContext) -> TaskReport {
    let span = tracing::info_span!(
        "task",
        task = envelope.task.name(),
        task_id = %envelope.id,
        queue = %envelope.queue,
        attempt = envelope.attempt,
    );
    let outcome = ctx.handler.handle(&envelope).instrument(span).await;
    TaskReport { envelope, outcome }
}
