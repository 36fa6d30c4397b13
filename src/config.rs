use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Which synchronous calls leave a delivery + payload in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDeliveryRecording {
    /// Record only calls whose payload came from a subscription document.
    SubscriptionOnly,
    Always,
    Never,
}

impl FromStr for SyncDeliveryRecording {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "subscription_only" | "subscription" => Ok(Self::SubscriptionOnly),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            _ => Err(()),
        }
    }
}

/// Task queue names, one per transport family so that slow external queues
/// do not starve HTTP delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub http: String,
    pub sqs: String,
    pub pubsub: String,
    pub payloads: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            http: "webhooks".into(),
            sqs: "webhooks-sqs".into(),
            pubsub: "webhooks-pubsub".into(),
            payloads: "webhooks-payloads".into(),
        }
    }
}

impl QueueNames {
    pub fn all(&self) -> Vec<String> {
        vec![
            self.http.clone(),
            self.sqs.clone(),
            self.pubsub.clone(),
            self.payloads.clone(),
        ]
    }
}

/// Circuit breaker thresholds for synchronous webhooks.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    pub enabled: bool,

    /// Failure ratio that opens the breaker.
    pub failure_threshold: f64,

    /// Calls needed inside the window before the ratio is considered.
    pub min_requests: usize,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 0.5,
            min_requests: 10,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    /// Value of the `Saleor-Domain` header.
    pub domain: String,

    /// Value of the `Saleor-Api-Url` header.
    pub api_url: String,

    /// Signs payloads of webhooks without a secret key.
    pub default_signing_key: Vec<u8>,

    /// Per-attempt timeout of async deliveries.
    pub http_timeout: Duration,

    /// Wall-clock timeout of sync calls.
    pub sync_timeout: Duration,
    pub retry_policy: RetryPolicy,

    /// Reject targets resolving to private, loopback or link-local addresses.
    pub ip_filter_enabled: bool,

    /// Delete deliveries (with attempts and payload) once successful.
    pub clear_successful_deliveries: bool,
    pub max_objects_per_bulk_insert: usize,

    /// Payloads above this size are written to the blob store.
    pub payload_inline_limit: usize,

    /// Deliveries handled by one per-app draining task.
    pub pending_batch_size: usize,

    /// Schedule one draining task per app instead of one task per delivery.
    pub batch_by_app: bool,
    pub queues: QueueNames,
    pub sync_recording: SyncDeliveryRecording,
    pub shipping_cache_ttl: Duration,
    pub breaker: BreakerSettings,
    pub observability_sample_rate: f64,
    pub observability_batch_size: usize,

    /// Reported as `version` in subscription payloads.
    pub version: String,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            domain: "localhost:8000".into(),
            api_url: "http://localhost:8000/graphql/".into(),
            default_signing_key: b"change-me".to_vec(),
            http_timeout: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(20),
            retry_policy: RetryPolicy::default(),
            ip_filter_enabled: true,
            clear_successful_deliveries: true,
            max_objects_per_bulk_insert: 1_000,
            payload_inline_limit: 256 * 1024,
            pending_batch_size: 100,
            batch_by_app: false,
            queues: QueueNames::default(),
            sync_recording: SyncDeliveryRecording::SubscriptionOnly,
            shipping_cache_ttl: Duration::from_secs(12 * 60 * 60),
            breaker: BreakerSettings::default(),
            observability_sample_rate: 1.0,
            observability_batch_size: 100,
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

impl WebhookSettings {
    /// Defaults overridden by `WEBHOOK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(domain) = lookup("WEBHOOK_DOMAIN") {
            settings.domain = domain;
        }
        if let Some(api_url) = lookup("WEBHOOK_API_URL") {
            settings.api_url = api_url;
        }
        if let Some(key) = lookup("WEBHOOK_DEFAULT_SIGNING_KEY") {
            settings.default_signing_key = key.into_bytes();
        }
        if let Some(secs) = parse::<f64, _>(&lookup, "WEBHOOK_TIMEOUT")? {
            settings.http_timeout = seconds(secs, "WEBHOOK_TIMEOUT")?;
        }
        if let Some(secs) = parse::<f64, _>(&lookup, "WEBHOOK_SYNC_TIMEOUT")? {
            settings.sync_timeout = seconds(secs, "WEBHOOK_SYNC_TIMEOUT")?;
        }
        if let Some(secs) = parse::<f64, _>(&lookup, "WEBHOOK_RETRY_BASE_SECONDS")? {
            settings.retry_policy.base = seconds(secs, "WEBHOOK_RETRY_BASE_SECONDS")?;
        }
        if let Some(max) = parse::<u32, _>(&lookup, "WEBHOOK_MAX_RETRIES")? {
            settings.retry_policy.max_attempts = max.max(1);
        }
        if let Some(enabled) = parse_bool(&lookup, "WEBHOOK_IP_FILTER_ENABLED")? {
            settings.ip_filter_enabled = enabled;
        }
        if let Some(clear) = parse_bool(&lookup, "WEBHOOK_CLEAR_SUCCESSFUL_DELIVERIES")? {
            settings.clear_successful_deliveries = clear;
        }
        if let Some(max) = parse::<usize, _>(&lookup, "WEBHOOK_MAX_OBJECTS_PER_BULK_INSERT")? {
            settings.max_objects_per_bulk_insert = max.max(1);
        }
        if let Some(limit) = parse::<usize, _>(&lookup, "WEBHOOK_PAYLOAD_INLINE_LIMIT")? {
            settings.payload_inline_limit = limit;
        }
        if let Some(size) = parse::<usize, _>(&lookup, "WEBHOOK_PENDING_BATCH_SIZE")? {
            settings.pending_batch_size = size.max(1);
        }
        if let Some(batch) = parse_bool(&lookup, "WEBHOOK_BATCH_BY_APP")? {
            settings.batch_by_app = batch;
        }
        if let Some(mode) = parse::<SyncDeliveryRecording, _>(&lookup, "WEBHOOK_SYNC_RECORDING")? {
            settings.sync_recording = mode;
        }
        if let Some(name) = lookup("WEBHOOK_QUEUE_NAME") {
            settings.queues.http = name;
        }
        if let Some(name) = lookup("WEBHOOK_SQS_QUEUE_NAME") {
            settings.queues.sqs = name;
        }
        if let Some(name) = lookup("WEBHOOK_PUBSUB_QUEUE_NAME") {
            settings.queues.pubsub = name;
        }
        if let Some(name) = lookup("WEBHOOK_PAYLOAD_QUEUE_NAME") {
            settings.queues.payloads = name;
        }
        if let Some(rate) = parse::<f64, _>(&lookup, "WEBHOOK_OBSERVABILITY_SAMPLE_RATE")? {
            settings.observability_sample_rate = rate.clamp(0.0, 1.0);
        }
        Ok(settings)
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn parse_bool<F>(lookup: &F, key: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::Invalid { key, value }),
        },
    }
}

fn seconds(secs: f64, key: &'static str) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::Invalid {
        key,
        value: secs.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn environment_overrides_defaults() {
        let settings = WebhookSettings::from_lookup(lookup(&[
            ("WEBHOOK_TIMEOUT", "2.5"),
            ("WEBHOOK_MAX_RETRIES", "3"),
            ("WEBHOOK_IP_FILTER_ENABLED", "false"),
            ("WEBHOOK_SYNC_RECORDING", "always"),
            ("WEBHOOK_SQS_QUEUE_NAME", "sqs-slow"),
        ]))
        .unwrap();

        assert_eq!(settings.http_timeout, Duration::from_millis(2500));
        assert_eq!(settings.retry_policy.max_attempts, 3);
        assert!(!settings.ip_filter_enabled);
        assert_eq!(settings.sync_recording, SyncDeliveryRecording::Always);
        assert_eq!(settings.queues.sqs, "sqs-slow");
        assert_eq!(settings.sync_timeout, Duration::from_secs(20));
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = WebhookSettings::from_lookup(lookup(&[("WEBHOOK_IP_FILTER_ENABLED", "maybe")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "WEBHOOK_IP_FILTER_ENABLED",
                value: "maybe".into()
            }
        );
        assert!(WebhookSettings::from_lookup(lookup(&[("WEBHOOK_TIMEOUT", "-1")])).is_err());
    }
}
