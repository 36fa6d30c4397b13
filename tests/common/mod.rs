#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use tokio::sync::Mutex;

use webhook_engine::{
    App, InMemoryLedger, InProcessScheduler, PubSubClient, PubSubMessage, RetryPolicy, SchedulerConfig, SqsClient,
    SqsMessage, TransportError, Webhook, WebhookEngine, WebhookSettings,
};

/// A request captured by the test receiver.
#[derive(Debug, Clone)]
pub struct Received {
    pub headers: HashMap<String, String>,
    pub body: String,
}

pub struct ReceiverState {
    pub status: AtomicU16,
    pub body: Mutex<String>,
    pub hits: AtomicUsize,
    pub requests: Mutex<Vec<Received>>,

    /// Milliseconds to wait before answering.
    pub delay_ms: AtomicU64,
}

/// Local HTTP server playing the receiving app.
pub struct Receiver {
    pub addr: SocketAddr,
    pub state: Arc<ReceiverState>,
}

impl Receiver {
    pub async fn start(status: u16, body: &str) -> Self {
        let state = Arc::new(ReceiverState {
            status: AtomicU16::new(status),
            body: Mutex::new(body.to_string()),
            hits: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            delay_ms: AtomicU64::new(0),
        });
        let app = Router::new().route("/hook", post(receive)).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}/hook", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<Received> {
        self.state.requests.lock().await.clone()
    }

    pub fn respond_after(&self, delay: Duration) {
        self.state.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn respond_with(&self, status: u16, body: &str) {
        self.state.status.store(status, Ordering::SeqCst);
        *self.state.body.lock().await = body.to_string();
    }
}

async fn receive(State(state): State<Arc<ReceiverState>>, headers: HeaderMap, body: String) -> (StatusCode, String) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let headers = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    state.requests.lock().await.push(Received { headers, body });
    let delay = state.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    let status = StatusCode::from_u16(state.status.load(Ordering::SeqCst)).unwrap_or(StatusCode::OK);
    (status, state.body.lock().await.clone())
}

#[derive(Default)]
pub struct RecordingSqs {
    pub messages: Mutex<Vec<SqsMessage>>,
}

#[async_trait]
impl SqsClient for RecordingSqs {
    async fn send_message(&self, message: SqsMessage) -> Result<String, TransportError> {
        let mut messages = self.messages.lock().await;
        messages.push(message);
        Ok(format!("msg-{}", messages.len()))
    }
}

#[derive(Default)]
pub struct RecordingPubSub {
    pub messages: Mutex<Vec<PubSubMessage>>,
}

#[async_trait]
impl PubSubClient for RecordingPubSub {
    async fn publish(&self, message: PubSubMessage) -> Result<String, TransportError> {
        let mut messages = self.messages.lock().await;
        messages.push(message);
        Ok(format!("pub-{}", messages.len()))
    }
}

pub fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_millis(5),
        max_attempts: 5,
        max_delay: Duration::from_millis(40),
    }
}

/// Settings for tests talking to the loopback receiver.
pub fn settings() -> WebhookSettings {
    WebhookSettings {
        ip_filter_enabled: false,
        clear_successful_deliveries: false,
        retry_policy: fast_retries(),
        http_timeout: Duration::from_secs(5),
        sync_timeout: Duration::from_secs(5),
        ..WebhookSettings::default()
    }
}

pub fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        queue_size: 1_000,
        worker_count: 4,
        retry_jitter_ms: 0,
    }
}

pub struct Harness {
    pub engine: WebhookEngine,
    pub scheduler: Arc<InProcessScheduler>,
    pub ledger: Arc<InMemoryLedger>,
}

impl Harness {
    pub async fn new(settings: WebhookSettings, apps: Vec<App>) -> Self {
        let ledger = Arc::new(InMemoryLedger::new());
        let (engine, scheduler) = WebhookEngine::builder(settings)
            .with_ledger(ledger.clone())
            .build_in_process(scheduler_config())
            .await
            .unwrap();
        for app in apps {
            engine.registry().register_app(app).await;
        }
        Self {
            engine,
            scheduler,
            ledger,
        }
    }

    pub async fn register(&self, webhooks: &[Webhook]) {
        for webhook in webhooks {
            self.engine.registry().register_webhook(webhook.clone()).await;
        }
    }
}
