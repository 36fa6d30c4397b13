//! Webhook delivery and subscription-payload engine.
//!
//! Turns domain events into outbound deliveries to third-party apps over
//! HTTP, AWS SQS and Google Pub/Sub.
//!
//! ## Flow
//! - The event router picks the webhooks of an event and splits them into
//!   regular (static payload) and subscription (generated payload) groups
//! - Payloads and deliveries are persisted in the delivery ledger
//! - Delivery ids are handed to a task scheduler; workers send, record one
//!   attempt per try and retry with exponential backoff
//! - Synchronous events block on one app's answer and parse it into typed
//!   results
//!
//! ## Guarantees
//! - At-least-once delivery; receivers must tolerate duplicates
//! - Attempts of one delivery never overlap
//! - Transport problems never propagate into domain code
//!
//! ## Non-Guarantees
//! - Ordering across deliveries
//! - Cancellation of enqueued deliveries

mod config;
mod dispatcher;
mod engine;
mod error;
pub mod event_types;
mod observability;
mod payload;
pub mod query;
pub mod response;
mod retry;
mod router;
mod scheduler;
mod signing;
mod storage;
mod sync;
mod transport;
mod types;
mod worker;

#[cfg(feature = "redis")]
mod storage_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use config::{BreakerSettings, QueueNames, SyncDeliveryRecording, WebhookSettings};
pub use dispatcher::{EntityLoader, NoEntityLoader, ObjectPayload};
pub use engine::{WebhookEngine, WebhookEngineBuilder};
pub use error::{ConfigError, DispatchError, FailureReason, LedgerError, QueryError, ResponseError, TransportError};
pub use event_types::{EventRegistry, EventRegistryBuilder, WebhookEventSpec};
pub use observability::{
    AttemptReport,
    BufferedObservability,
    NoopObservability,
    ObservabilityExporter,
    ObservabilitySink,
};
pub use payload::{GenerationCache, PayloadGenerator, PreSavePayloads, SYNC_FIELD_NOT_ALLOWED};
pub use retry::{AttemptController, RetryDecision, RetryPolicy};
pub use router::{channel_matches, group_webhooks_by_subscription, EventRouter, RoutedWebhooks, WebhookRegistry};
pub use scheduler::{
    Envelope,
    InProcessScheduler,
    OnCommitScheduler,
    Scheduler,
    SchedulerConfig,
    TaskHandler,
    TaskMessage,
    TaskOutcome,
};
pub use signing::{
    compute_signature,
    parse_signature_header,
    signature_for_payload,
    verify_signature,
    verify_webhook_request,
    VerificationError,
};
pub use storage::{DeliveryLedger, InMemoryBlobStore, InMemoryLedger, PayloadBlobStore, PayloadStore};
pub use sync::{CircuitBreaker, ResponseCache, RESPONSE_CACHE_CAPACITY};
pub use transport::{
    queue_for_target,
    OutboundRequest,
    PubSubClient,
    PubSubMessage,
    SqsClient,
    SqsMessage,
    Transport,
    UnconfiguredQueueClient,
    WebhookScheme,
};
pub use types::{
    global_id,
    App, AppId, AttemptId, DeliveryId, DeliveryStatus, Entity, EventDelivery, EventDeliveryAttempt, EventPayload,
    ModelRef, PayloadId, PayloadSource, Requestor, SubscribablePayload, Webhook, WebhookId, WebhookResponse,
};

#[cfg(feature = "redis")]
pub use storage_redis::RedisBlobStore;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresLedger;
