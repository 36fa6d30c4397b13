use thiserror::Error;

use crate::types::{AttemptId, DeliveryStatus};

/// Errors returned when fanning out an event fails *before* any transport
/// work begins.
///
/// These are programming or infrastructure errors. Transport problems never
/// surface here; they are recorded as failed attempts instead.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Regular webhooks were selected but neither a payload nor a generator
    /// was supplied.
    #[error("no payload or payload generator supplied for event `{event_type}`")]
    MissingPayload { event_type: String },

    /// Task was routed to a queue the scheduler does not know.
    #[error("unknown task queue `{0}`")]
    UnknownQueue(String),

    /// Scheduler queue is full.
    /// Caller must retry or apply backoff.
    #[error("task queue `{0}` is at capacity")]
    Backpressure(String),

    /// Scheduler has been shut down.
    #[error("scheduler is shut down")]
    Shutdown,

    /// Engine was assembled without a required collaborator.
    #[error("engine misconfigured: {0}")]
    Configuration(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the delivery ledger and payload store.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },

    /// Deliveries only move from PENDING to a terminal state.
    #[error("delivery status cannot change from {from:?} to {to:?}")]
    InvalidTransition {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    /// Attempts are updated exactly once after the transport call returns.
    #[error("attempt {0} already has a recorded outcome")]
    AttemptAlreadyRecorded(AttemptId),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors produced while parsing or executing a subscription document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("syntax error at {line}:{column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("document does not contain an operation")]
    MissingOperation,

    #[error("document contains more than one operation")]
    MultipleOperations,

    #[error("operation type `{0}` is not supported for webhook payloads")]
    UnsupportedOperation(String),

    #[error("unknown fragment `{0}`")]
    UnknownFragment(String),

    #[error("fragment `{0}` spreads itself")]
    FragmentCycle(String),

    #[error("event `{0}` has no subscription type")]
    UnknownEvent(String),

    #[error("selections nest deeper than {max_depth} levels")]
    NestingTooDeep { max_depth: usize },
}

/// Reasons why a single transport attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("request timed out")]
    Timeout,

    #[error("network error")]
    Network,

    #[error("remote endpoint returned error")]
    RemoteError,

    #[error("client error (non-retryable)")]
    ClientError,

    #[error("target resolves to a forbidden address")]
    InvalidAddress,

    #[error("unsupported webhook scheme")]
    UnsupportedScheme,

    #[error("queue client rejected the message")]
    QueueRejected,
}

impl FailureReason {
    /// Only server-side and connection level failures are worth another try.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::Timeout
                | FailureReason::Network
                | FailureReason::RemoteError
                | FailureReason::InvalidAddress
                | FailureReason::QueueRejected
        )
    }
}

/// Errors raised by transport clients before a response exists.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid target url `{0}`")]
    InvalidUrl(String),

    #[error("Invalid IP address")]
    InvalidAddress,

    #[error("{0} client is not configured")]
    NotConfigured(&'static str),

    #[error("queue client error: {0}")]
    Client(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Errors raised while interpreting a synchronous webhook response.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResponseError {
    #[error("response is not a JSON object")]
    NotAnObject,

    #[error("missing or invalid field `{0}`")]
    InvalidField(String),

    #[error("expected {expected} lines, got {actual}")]
    LineCountMismatch { expected: usize, actual: usize },

    #[error("negative amount in field `{0}`")]
    NegativeAmount(String),
}

/// Invalid values in the process environment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("environment variable {key} has invalid value `{value}`")]
    Invalid { key: &'static str, value: String },
}
