//! Task scheduling.
//!
//! Fan-out code only ever talks to the [`Scheduler`] trait. The in-process
//! implementation runs a scheduler loop that round-robins over named queues,
//! parks retries on a delay heap and feeds a shared worker pool.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::error::DispatchError;
use crate::observability::metric_inc;
use crate::retry::RetryPolicy;
use crate::types::{AppId, DeliveryId, ModelRef};
use crate::worker::{worker_loop, TaskReport, WorkerContext};

/// Work items understood by the engine's task handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskMessage {
    /// Deliver one delivery; the payload is re-read from the ledger.
    SendWebhookRequest { delivery_id: DeliveryId },

    /// Generate payloads for deliveries created without one.
    GenerateDeferredPayloads {
        event_type: String,
        object: ModelRef,
        requestor: Option<ModelRef>,
        delivery_ids: Vec<DeliveryId>,
    },

    /// Drain pending deliveries of one app.
    SendWebhooksForApp { app_id: AppId },
}

impl TaskMessage {
    pub fn name(&self) -> &'static str {
        match self {
            TaskMessage::SendWebhookRequest { .. } => "send_webhook_request_async",
            TaskMessage::GenerateDeferredPayloads { .. } => "generate_deferred_payloads",
            TaskMessage::SendWebhooksForApp { .. } => "send_webhooks_async_for_app",
        }
    }
}

/// A task as it travels through the queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Stable across retries; stored on delivery attempts.
    pub id: String,
    pub task: TaskMessage,
    pub queue: String,
    pub retry_policy: RetryPolicy,

    /// 1 for the first run.
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Retry { countdown: Duration },
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> TaskOutcome;
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn enqueue(&self, task: TaskMessage, queue: &str, retry_policy: &RetryPolicy) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub queue_size: usize,
    pub worker_count: usize,

    /// Upper bound of the random delay added to every retry countdown.
    pub retry_jitter_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            queue_size: 10_000,
            worker_count,
            retry_jitter_ms: 0,
        }
    }
}

struct QueueReceiver {
    name: String,
    rx: mpsc::Receiver<Envelope>,
}

/// Channels created up front and consumed by `start`.
struct Pending {
    receivers: Vec<QueueReceiver>,
    report_rx: mpsc::UnboundedReceiver<TaskReport>,
}

/// Tokio worker pool with one bounded queue per queue name.
pub struct InProcessScheduler {
    config: SchedulerConfig,
    senders: RwLock<HashMap<String, mpsc::Sender<Envelope>>>,
    report_tx: mpsc::UnboundedSender<TaskReport>,
    pending: Mutex<Option<Pending>>,
    notify: Arc<Notify>,
    is_running: Arc<AtomicBool>,
    outstanding: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl InProcessScheduler {
    pub fn new<I, S>(config: SchedulerConfig, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut senders = HashMap::new();
        let mut receivers = Vec::new();
        for name in queues {
            let name = name.into();
            if senders.contains_key(&name) {
                continue;
            }
            let (tx, rx) = mpsc::channel(config.queue_size.max(1));
            senders.insert(name.clone(), tx);
            receivers.push(QueueReceiver { name, rx });
        }
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        Self {
            config,
            senders: RwLock::new(senders),
            report_tx,
            pending: Mutex::new(Some(Pending { receivers, report_rx })),
            notify: Arc::new(Notify::new()),
            is_running: Arc::new(AtomicBool::new(true)),
            outstanding: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the scheduler loop and workers. Tasks enqueued earlier are kept
    /// and run once started. Calling it twice is a no-op.
    pub async fn start(&self, handler: Arc<dyn TaskHandler>) {
        let Some(Pending { mut receivers, mut report_rx }) = self.pending.lock().await.take() else {
            return;
        };

        let (ready_tx, ready_rx) = mpsc::channel::<Envelope>(self.config.queue_size.max(1));
        let shared_ready_rx = Arc::new(Mutex::new(ready_rx));
        let ctx = Arc::new(WorkerContext {
            handler,
            report_tx: self.report_tx.clone(),
            notify: self.notify.clone(),
        });

        let mut handles = self.handles.lock().await;
        for _ in 0..self.config.worker_count.max(1) {
            handles.push(tokio::spawn(worker_loop(shared_ready_rx.clone(), ctx.clone())));
        }

        let notify = self.notify.clone();
        let running = self.is_running.clone();
        let outstanding = self.outstanding.clone();
        let idle = self.idle.clone();
        let jitter_ms = self.config.retry_jitter_ms;

        handles.push(tokio::spawn(async move {
            let mut next_index = 0usize;
            let mut delay_heap: BinaryHeap<TimedTask> = BinaryHeap::new();

            loop {
                let mut moved_any = false;
                let mut all_disconnected = true;
                let running = running.load(Ordering::SeqCst);

                if !running && !delay_heap.is_empty() {
                    tracing::warn!(dropped = delay_heap.len(), "dropping delayed tasks on shutdown");
                    for _ in 0..delay_heap.len() {
                        finish_one(&outstanding, &idle);
                    }
                    delay_heap.clear();
                }

                // Move due retries back to the front of the pipeline.
                let now = Instant::now();
                while delay_heap.peek().map(|t| t.ready_at <= now).unwrap_or(false) {
                    let Some(timed) = delay_heap.pop() else { break };
                    moved_any = true;
                    if ready_tx.send(timed.envelope).await.is_err() {
                        return;
                    }
                }

                let queue_count = receivers.len();
                for offset in 0..queue_count {
                    let index = (next_index + offset) % queue_count;
                    let receiver = &mut receivers[index];
                    match receiver.rx.try_recv() {
                        Ok(envelope) => {
                            moved_any = true;
                            all_disconnected = false;
                            tracing::trace!(queue = %receiver.name, task = envelope.task.name(), "task ready");
                            if ready_tx.send(envelope).await.is_err() {
                                return;
                            }
                            next_index = (index + 1) % queue_count;
                            break;
                        }
                        Err(mpsc::error::TryRecvError::Empty) => {
                            all_disconnected = false;
                        }
                        Err(mpsc::error::TryRecvError::Disconnected) => {}
                    }
                }

                while let Ok(report) = report_rx.try_recv() {
                    handle_report(report, &mut delay_heap, jitter_ms, &outstanding, &idle);
                }

                if !moved_any {
                    if !running && all_disconnected && delay_heap.is_empty() {
                        return;
                    }

                    let next_ready = delay_heap.peek().map(|t| t.ready_at);
                    tokio::select! {
                        _ = notify.notified() => {}
                        report = report_rx.recv() => {
                            if let Some(report) = report {
                                handle_report(report, &mut delay_heap, jitter_ms, &outstanding, &idle);
                            }
                        }
                        _ = sleep_until(next_ready.unwrap_or_else(Instant::now)), if next_ready.is_some() => {}
                    }
                }
            }
        }));
    }

    /// Resolves once nothing is queued, delayed or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Tasks accepted but not finished yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop accepting tasks, let queued ones run and wait for the pool.
    /// Delayed retries are dropped; their deliveries stay PENDING.
    pub async fn shutdown(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.senders.write().await.clear();
        self.notify.notify_one();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl Scheduler for InProcessScheduler {
    async fn enqueue(&self, task: TaskMessage, queue: &str, retry_policy: &RetryPolicy) -> Result<(), DispatchError> {
        if !self.is_running() {
            return Err(DispatchError::Shutdown);
        }
        let sender = {
            let guard = self.senders.read().await;
            guard
                .get(queue)
                .cloned()
                .ok_or_else(|| DispatchError::UnknownQueue(queue.to_string()))?
        };

        let envelope = Envelope {
            id: uuid::Uuid::new_v4().to_string(),
            task,
            queue: queue.to_string(),
            retry_policy: retry_policy.clone(),
            attempt: 1,
        };
        let name = envelope.task.name();

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(envelope) {
            Ok(()) => {
                tracing::debug!(queue, task = name, "task enqueued");
                metric_inc("webhook.task.enqueued");
                self.notify.notify_one();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                finish_one(&self.outstanding, &self.idle);
                metric_inc("webhook.task.backpressure");
                Err(DispatchError::Backpressure(queue.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                finish_one(&self.outstanding, &self.idle);
                Err(DispatchError::Shutdown)
            }
        }
    }
}

/// Holds tasks until the surrounding transaction commits.
pub struct OnCommitScheduler {
    inner: Arc<dyn Scheduler>,
    buffered: Mutex<Vec<(TaskMessage, String, RetryPolicy)>>,
}

impl OnCommitScheduler {
    pub fn new(inner: Arc<dyn Scheduler>) -> Self {
        Self {
            inner,
            buffered: Mutex::new(Vec::new()),
        }
    }

    /// Forward every buffered task, in enqueue order.
    pub async fn commit(&self) -> Result<usize, DispatchError> {
        let tasks = std::mem::take(&mut *self.buffered.lock().await);
        let count = tasks.len();
        for (task, queue, policy) in tasks {
            self.inner.enqueue(task, &queue, &policy).await?;
        }
        Ok(count)
    }

    /// Drop buffered tasks.
    pub async fn rollback(&self) -> usize {
        let mut buffered = self.buffered.lock().await;
        let count = buffered.len();
        buffered.clear();
        count
    }

    pub async fn pending(&self) -> usize {
        self.buffered.lock().await.len()
    }
}

#[async_trait]
impl Scheduler for OnCommitScheduler {
    async fn enqueue(&self, task: TaskMessage, queue: &str, retry_policy: &RetryPolicy) -> Result<(), DispatchError> {
        self.buffered
            .lock()
            .await
            .push((task, queue.to_string(), retry_policy.clone()));
        Ok(())
    }
}

fn finish_one(outstanding: &AtomicUsize, idle: &Notify) {
    if outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
        idle.notify_waiters();
    }
}

fn handle_report(
    report: TaskReport,
    delay_heap: &mut BinaryHeap<TimedTask>,
    jitter_ms: u64,
    outstanding: &AtomicUsize,
    idle: &Notify,
) {
    let TaskReport { mut envelope, outcome } = report;
    match outcome {
        TaskOutcome::Done => {
            metric_inc("webhook.task.done");
            finish_one(outstanding, idle);
        }
        TaskOutcome::Retry { countdown } => {
            if envelope.attempt >= envelope.retry_policy.max_attempts {
                tracing::warn!(
                    task_id = %envelope.id,
                    task = envelope.task.name(),
                    attempts = envelope.attempt,
                    "task retry budget exhausted"
                );
                metric_inc("webhook.task.exhausted");
                finish_one(outstanding, idle);
                return;
            }
            envelope.attempt += 1;
            metric_inc("webhook.task.retry_scheduled");
            delay_heap.push(TimedTask {
                ready_at: Instant::now() + countdown + jitter_delay(jitter_ms),
                envelope,
            });
        }
    }
}

fn jitter_delay(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::from_millis(0);
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}

#[derive(Debug)]
struct TimedTask {
    ready_at: Instant,
    envelope: Envelope,
}

impl Eq for TimedTask {}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at.eq(&other.ready_at)
    }
}

impl Ord for TimedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.ready_at.cmp(&self.ready_at)
    }
}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting {
        runs: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl TaskHandler for Counting {
        async fn handle(&self, _envelope: &Envelope) -> TaskOutcome {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < self.fail_first {
                TaskOutcome::Retry {
                    countdown: Duration::from_millis(5),
                }
            } else {
                TaskOutcome::Done
            }
        }
    }

    fn task() -> TaskMessage {
        TaskMessage::SendWebhooksForApp { app_id: AppId("1".into()) }
    }

    #[tokio::test]
    async fn retries_until_done() {
        let scheduler = InProcessScheduler::new(SchedulerConfig::default(), ["webhooks"]);
        let handler = Arc::new(Counting {
            runs: AtomicUsize::new(0),
            fail_first: 2,
        });
        scheduler.start(handler.clone()).await;

        scheduler.enqueue(task(), "webhooks", &RetryPolicy::default()).await.unwrap();
        scheduler.wait_idle().await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 3);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn retry_budget_caps_runs() {
        let scheduler = InProcessScheduler::new(SchedulerConfig::default(), ["webhooks"]);
        let handler = Arc::new(Counting {
            runs: AtomicUsize::new(0),
            fail_first: usize::MAX,
        });
        scheduler.start(handler.clone()).await;

        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        scheduler.enqueue(task(), "webhooks", &policy).await.unwrap();
        scheduler.wait_idle().await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unknown_queue_is_rejected() {
        let scheduler = InProcessScheduler::new(SchedulerConfig::default(), ["webhooks"]);
        let err = scheduler
            .enqueue(task(), "elsewhere", &RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownQueue(name) if name == "elsewhere"));
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[tokio::test]
    async fn rollback_enqueues_nothing() {
        let inner = Arc::new(InProcessScheduler::new(SchedulerConfig::default(), ["webhooks"]));
        let on_commit = OnCommitScheduler::new(inner.clone());

        on_commit.enqueue(task(), "webhooks", &RetryPolicy::default()).await.unwrap();
        assert_eq!(on_commit.rollback().await, 1);
        assert_eq!(on_commit.commit().await.unwrap(), 0);
        assert_eq!(inner.outstanding(), 0);

        on_commit.enqueue(task(), "webhooks", &RetryPolicy::default()).await.unwrap();
        assert_eq!(on_commit.commit().await.unwrap(), 1);
        assert_eq!(inner.outstanding(), 1);
    }
}
