//! Synchronous webhooks: one blocking round trip to one app.
//!
//! Callers get `None` (or a typed failure result) whenever the app cannot or
//! did not answer; transport problems never surface as errors.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{BreakerSettings, SyncDeliveryRecording};
use crate::engine::WebhookEngine;
use crate::error::FailureReason;
use crate::event_types::{
    PAYMENT_GATEWAY_INITIALIZE_SESSION, SHIPPING_LIST_METHODS_FOR_CHECKOUT, STORED_PAYMENT_METHOD_REQUEST_DELETE,
};
use crate::observability::metric_inc;
use crate::payload::GenerationCache;
use crate::response::{
    parse_excluded_shipping_methods, parse_payment_gateway_response, parse_shipping_methods,
    parse_stored_payment_method_delete, parse_tax_data, parse_transaction_response, ExcludedShippingMethod,
    PaymentGatewayData, ShippingMethodData, StoredPaymentMethodDeleteResult, TaxData, TransactionResult,
};
use crate::transport::OutboundRequest;
use crate::types::{
    App, DeliveryStatus, EventDelivery, EventDeliveryAttempt, PayloadSource, Requestor, SubscribablePayload,
    Webhook, WebhookId, WebhookResponse,
};

#[derive(Debug, Default)]
struct BreakerState {
    calls: VecDeque<(Instant, bool)>,
    open_until: Option<Instant>,
}

/// Per-webhook circuit breaker for synchronous calls.
///
/// Opens when the failure ratio over the sliding window reaches the
/// threshold, once at least `min_requests` calls were seen. While open every
/// call is refused; after the cooldown the window starts empty.
#[derive(Debug)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    state: Mutex<HashMap<WebhookId, BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub async fn allows(&self, webhook_id: &WebhookId) -> bool {
        if !self.settings.enabled {
            return true;
        }
        let mut guard = self.state.lock().await;
        let Some(state) = guard.get_mut(webhook_id) else {
            return true;
        };
        match state.open_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                tracing::info!(webhook_id = %webhook_id, "circuit breaker closed after cooldown");
                *state = BreakerState::default();
                true
            }
            None => true,
        }
    }

    pub async fn record(&self, webhook_id: &WebhookId, success: bool) {
        if !self.settings.enabled {
            return;
        }
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        let state = guard.entry(webhook_id.clone()).or_default();
        state.calls.push_back((now, success));
        while let Some((at, _)) = state.calls.front() {
            if now.duration_since(*at) > self.settings.window {
                state.calls.pop_front();
            } else {
                break;
            }
        }

        let total = state.calls.len();
        if total < self.settings.min_requests.max(1) {
            return;
        }
        let failures = state.calls.iter().filter(|(_, ok)| !ok).count();
        if failures as f64 / total as f64 >= self.settings.failure_threshold {
            tracing::warn!(webhook_id = %webhook_id, failures, total, "circuit breaker opened");
            metric_inc("webhook.sync.breaker_opened");
            state.calls.clear();
            state.open_until = Some(now + self.settings.cooldown);
        }
    }

    pub async fn is_open(&self, webhook_id: &WebhookId) -> bool {
        let guard = self.state.lock().await;
        matches!(
            guard.get(webhook_id).and_then(|s| s.open_until),
            Some(until) if Instant::now() < until
        )
    }
}

/// Live entries kept by a [`ResponseCache`]; the oldest goes first.
pub const RESPONSE_CACHE_CAPACITY: usize = 10_000;

/// TTL cache of parsed sync responses. Expired entries are pruned on insert.
#[derive(Debug)]
pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, Value)>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cache key of one request. `issuedAt` is ignored so that payloads
    /// generated for the same state share a key.
    pub fn key(event_type: &str, webhook_id: &WebhookId, payload: &str) -> String {
        let normalized = match serde_json::from_str::<Value>(payload) {
            Ok(mut value) => {
                strip_issued_at(&mut value);
                value.to_string()
            }
            Err(_) => payload.to_string(),
        };
        let mut hasher = Sha256::new();
        hasher.update(event_type.as_bytes());
        hasher.update(b"\0");
        hasher.update(webhook_id.0.as_bytes());
        hasher.update(b"\0");
        hasher.update(normalized.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn insert(&self, key: String, value: Value) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.lock().await;
        let ttl = self.ttl;
        entries.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
        if entries.len() >= RESPONSE_CACHE_CAPACITY && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, (stored_at, _))| *stored_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(key, (Instant::now(), value));
    }
}

fn strip_issued_at(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("issuedAt");
            map.values_mut().for_each(strip_issued_at);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_issued_at),
        _ => {}
    }
}

/// Payload prepared for one sync call.
struct SyncPayload {
    text: String,
    from_subscription: bool,
}

/// Ledger records of a recorded sync call.
struct SyncRecord {
    delivery: EventDelivery,
    attempt: EventDeliveryAttempt,
}

impl WebhookEngine {
    /// Call one webhook synchronously.
    ///
    /// Returns `None` when the webhook or its app may not receive the event,
    /// when no payload could be built, when the circuit is open, and when the
    /// call failed or timed out. Sync calls are never retried.
    pub async fn trigger_webhook_sync(
        &self,
        event_type: &str,
        source: PayloadSource,
        webhook: &Webhook,
        subscribable: Option<&SubscribablePayload>,
        requestor: Option<&Requestor>,
        timeout: Option<Duration>,
    ) -> Option<WebhookResponse> {
        let app = self.sync_target(event_type, webhook).await?;
        let payload = self.sync_payload(event_type, source, webhook, &app, subscribable, requestor)?;
        self.send_sync(event_type, webhook, payload, timeout).await
    }

    /// Like [`WebhookEngine::trigger_webhook_sync`], returning the parsed
    /// response body.
    pub async fn trigger_webhook_sync_json(
        &self,
        event_type: &str,
        source: PayloadSource,
        webhook: &Webhook,
        subscribable: Option<&SubscribablePayload>,
        requestor: Option<&Requestor>,
        timeout: Option<Duration>,
    ) -> Option<Value> {
        let response = self
            .trigger_webhook_sync(event_type, source, webhook, subscribable, requestor, timeout)
            .await?;
        parse_body(event_type, webhook, &response)
    }

    /// Active sync webhooks for `event_type`, optionally limited to the app
    /// with the given identifier, in registration order.
    pub async fn sync_webhooks_for_event(&self, event_type: &str, app_identifier: Option<&str>) -> Vec<Webhook> {
        let apps = self.webhooks.apps().await;
        let webhooks = self.webhooks.webhooks().await;
        self.router
            .webhooks_for_event(event_type, &webhooks, &apps)
            .into_iter()
            .filter(|webhook| match app_identifier {
                Some(identifier) => apps
                    .get(&webhook.app_id)
                    .and_then(|app| app.identifier.as_deref())
                    .map(|i| i == identifier)
                    .unwrap_or(false),
                None => true,
            })
            .collect()
    }

    /// Tax breakdown from the first app that answers.
    pub async fn get_taxes(
        &self,
        event_type: &str,
        subscribable: &SubscribablePayload,
        legacy_payload: Option<&str>,
        expected_lines: usize,
        app_identifier: Option<&str>,
    ) -> Option<TaxData> {
        for webhook in self.sync_webhooks_for_event(event_type, app_identifier).await {
            let Some(value) = self
                .trigger_webhook_sync_json(
                    event_type,
                    static_source(legacy_payload),
                    &webhook,
                    Some(subscribable),
                    None,
                    None,
                )
                .await
            else {
                continue;
            };
            return match parse_tax_data(&value, expected_lines) {
                Ok(taxes) => Some(taxes),
                Err(err) => {
                    tracing::warn!(event_type, webhook_id = %webhook.id, error = %err, "invalid tax response");
                    None
                }
            };
        }
        None
    }

    /// Shipping methods offered by every shipping app, served from the
    /// response cache when the payload did not change.
    pub async fn list_shipping_methods(
        &self,
        checkout: &SubscribablePayload,
        legacy_payload: Option<&str>,
    ) -> Vec<ShippingMethodData> {
        let event_type = SHIPPING_LIST_METHODS_FOR_CHECKOUT;
        let mut methods = Vec::new();
        for webhook in self.sync_webhooks_for_event(event_type, None).await {
            let Some(value) = self.cached_sync_json(event_type, &webhook, checkout, legacy_payload).await else {
                continue;
            };
            methods.extend(parse_shipping_methods(&value, &webhook.app_id));
        }
        methods
    }

    /// Shipping methods apps ask to hide for a checkout or order.
    ///
    /// `subscribable` carries the object and the candidate methods as
    /// context.
    pub async fn excluded_shipping_methods(
        &self,
        event_type: &str,
        subscribable: &SubscribablePayload,
        legacy_payload: Option<&str>,
    ) -> Vec<ExcludedShippingMethod> {
        let mut excluded = Vec::new();
        for webhook in self.sync_webhooks_for_event(event_type, None).await {
            let Some(value) = self.cached_sync_json(event_type, &webhook, subscribable, legacy_payload).await else {
                continue;
            };
            match parse_excluded_shipping_methods(&value) {
                Ok(methods) => excluded.extend(methods),
                Err(err) => {
                    tracing::warn!(event_type, webhook_id = %webhook.id, error = %err, "invalid excluded methods response")
                }
            }
        }
        excluded
    }

    /// Transaction initialize or process session against the app owning the
    /// transaction.
    pub async fn transaction_session(
        &self,
        event_type: &str,
        webhook: &Webhook,
        transaction: &SubscribablePayload,
        requestor: Option<&Requestor>,
    ) -> TransactionResult {
        let value = self
            .trigger_webhook_sync_json(event_type, PayloadSource::Absent, webhook, Some(transaction), requestor, None)
            .await;
        let result = parse_transaction_response(value.as_ref());
        if let Some(error) = &result.error {
            tracing::warn!(event_type, webhook_id = %webhook.id, error = %error, "transaction session failed");
        }
        result
    }

    /// Initialize payment gateway sessions, one result per payment app.
    pub async fn payment_gateway_initialize_session(
        &self,
        source_object: &SubscribablePayload,
        requestor: Option<&Requestor>,
        app_identifiers: &[String],
    ) -> Vec<PaymentGatewayData> {
        let event_type = PAYMENT_GATEWAY_INITIALIZE_SESSION;
        let apps = self.webhooks.apps().await;
        let mut results = Vec::new();
        for webhook in self.sync_webhooks_for_event(event_type, None).await {
            let Some(app) = apps.get(&webhook.app_id) else {
                continue;
            };
            let identifier = app.identifier.clone().unwrap_or_else(|| app.id.0.clone());
            if !app_identifiers.is_empty() && !app_identifiers.contains(&identifier) {
                continue;
            }
            let value = self
                .trigger_webhook_sync_json(event_type, PayloadSource::Absent, &webhook, Some(source_object), requestor, None)
                .await;
            results.push(parse_payment_gateway_response(identifier, value.as_ref()));
        }
        results
    }

    pub async fn stored_payment_method_delete(
        &self,
        webhook: &Webhook,
        user: &SubscribablePayload,
        requestor: Option<&Requestor>,
    ) -> StoredPaymentMethodDeleteResult {
        let value = self
            .trigger_webhook_sync_json(
                STORED_PAYMENT_METHOD_REQUEST_DELETE,
                PayloadSource::Absent,
                webhook,
                Some(user),
                requestor,
                None,
            )
            .await;
        parse_stored_payment_method_delete(value.as_ref())
    }

    async fn cached_sync_json(
        &self,
        event_type: &str,
        webhook: &Webhook,
        subscribable: &SubscribablePayload,
        legacy_payload: Option<&str>,
    ) -> Option<Value> {
        let app = self.sync_target(event_type, webhook).await?;
        let payload = self.sync_payload(
            event_type,
            static_source(legacy_payload),
            webhook,
            &app,
            Some(subscribable),
            None,
        )?;
        let key = ResponseCache::key(event_type, &webhook.id, &payload.text);
        if let Some(cached) = self.shipping_cache.get(&key).await {
            tracing::debug!(event_type, webhook_id = %webhook.id, "sync response served from cache");
            metric_inc("webhook.sync.cache_hit");
            return Some(cached);
        }
        let response = self.send_sync(event_type, webhook, payload, None).await?;
        let value = parse_body(event_type, webhook, &response)?;
        self.shipping_cache.insert(key, value.clone()).await;
        Some(value)
    }

    /// App owning `webhook`, when the webhook may be called for `event_type`.
    async fn sync_target(&self, event_type: &str, webhook: &Webhook) -> Option<App> {
        if !webhook.is_active {
            tracing::debug!(event_type, webhook_id = %webhook.id, "sync webhook inactive");
            return None;
        }
        let Some(app) = self.webhooks.app(&webhook.app_id).await.filter(App::is_available) else {
            tracing::debug!(event_type, app_id = %webhook.app_id, "sync webhook app unavailable");
            return None;
        };
        if !webhook.is_subscribed_to(event_type) {
            tracing::debug!(event_type, webhook_id = %webhook.id, "webhook not subscribed to sync event");
            return None;
        }
        let permission = self
            .generator
            .registry()
            .get(event_type)
            .and_then(|spec| spec.permission.as_deref());
        if let Some(permission) = permission {
            if !app.has_permission(permission) {
                tracing::warn!(event_type, app_id = %app.id, permission, "app lacks permission for sync event");
                return None;
            }
        }
        Some(app)
    }

    fn sync_payload(
        &self,
        event_type: &str,
        source: PayloadSource,
        webhook: &Webhook,
        app: &App,
        subscribable: Option<&SubscribablePayload>,
        requestor: Option<&Requestor>,
    ) -> Option<SyncPayload> {
        if let Some(query) = webhook.subscription_query.as_deref().filter(|_| webhook.has_subscription()) {
            let Some(subscribable) = subscribable else {
                tracing::warn!(event_type, webhook_id = %webhook.id, "no subscribable object for sync subscription webhook");
                return None;
            };
            let mut cache = GenerationCache::new();
            let value = match self
                .generator
                .generate(event_type, subscribable, query, &mut cache, requestor, Some(app))
            {
                Ok(Some(value)) => value,
                Ok(None) => return None,
                Err(err) => {
                    tracing::warn!(event_type, webhook_id = %webhook.id, error = %err, "sync payload generation failed");
                    return None;
                }
            };
            return Some(SyncPayload {
                text: value.to_string(),
                from_subscription: true,
            });
        }
        let Some(text) = source.resolve() else {
            tracing::debug!(event_type, webhook_id = %webhook.id, "no static payload for sync webhook");
            return None;
        };
        Some(SyncPayload {
            text,
            from_subscription: false,
        })
    }

    async fn send_sync(
        &self,
        event_type: &str,
        webhook: &Webhook,
        payload: SyncPayload,
        timeout: Option<Duration>,
    ) -> Option<WebhookResponse> {
        if !self.breaker.allows(&webhook.id).await {
            tracing::warn!(event_type, webhook_id = %webhook.id, "circuit open, skipping sync webhook");
            metric_inc("webhook.sync.breaker_rejected");
            return None;
        }

        let record = match self.settings.sync_recording {
            SyncDeliveryRecording::Always => true,
            SyncDeliveryRecording::SubscriptionOnly => payload.from_subscription,
            SyncDeliveryRecording::Never => false,
        };
        let timeout = timeout.unwrap_or(self.settings.sync_timeout);
        let mut request = OutboundRequest::for_webhook(webhook, event_type, payload.text.clone(), timeout);
        let recorded = if record {
            self.record_sync_call(event_type, webhook, payload.text).await
        } else {
            None
        };
        if let Some(record) = &recorded {
            if let Some(payload_id) = record.delivery.payload_id {
                request = request.with_payload_id(payload_id);
            }
        }

        let response = match tokio::time::timeout(timeout, self.transport.send(&request)).await {
            Ok(response) => response,
            Err(_) => {
                let mut response = WebhookResponse::failed(FailureReason::Timeout, "Request timed out");
                response.duration = timeout;
                response
            }
        };
        self.breaker.record(&webhook.id, response.is_success()).await;

        if let Some(SyncRecord { delivery, attempt }) = recorded {
            let status = if response.is_success() {
                DeliveryStatus::Success
            } else {
                DeliveryStatus::Failed
            };
            let finished = match self.attempts.finish(&delivery, attempt, &response).await {
                Ok(_) => self.ledger.set_delivery_status(&delivery.id, status).await,
                Err(err) => Err(err),
            };
            if let Err(err) = finished {
                tracing::warn!(event_type, delivery_id = %delivery.id, error = %err, "cannot record sync outcome");
            }
        }

        if response.is_success() {
            tracing::info!(event_type, webhook_id = %webhook.id, "sync webhook answered");
            metric_inc("webhook.sync.success");
            Some(response)
        } else {
            tracing::warn!(
                event_type,
                webhook_id = %webhook.id,
                status_code = response.status_code,
                content = %response.content,
                "sync webhook failed"
            );
            metric_inc("webhook.sync.failure");
            None
        }
    }

    async fn record_sync_call(&self, event_type: &str, webhook: &Webhook, text: String) -> Option<SyncRecord> {
        let result = async {
            let payload = self.payloads.create(text).await?;
            let delivery = EventDelivery::new(event_type, webhook.id.clone(), Some(payload.id));
            self.ledger.bulk_create_deliveries(std::slice::from_ref(&delivery)).await?;
            let attempt = self.attempts.begin(&delivery, None).await?;
            Ok::<_, crate::error::LedgerError>(SyncRecord { delivery, attempt })
        }
        .await;
        match result {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(event_type, webhook_id = %webhook.id, error = %err, "cannot record sync delivery");
                None
            }
        }
    }
}

fn static_source(legacy_payload: Option<&str>) -> PayloadSource {
    match legacy_payload {
        Some(text) => PayloadSource::Static(text.to_string()),
        None => PayloadSource::Absent,
    }
}

fn parse_body(event_type: &str, webhook: &Webhook, response: &WebhookResponse) -> Option<Value> {
    match serde_json::from_str(&response.content) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(event_type, webhook_id = %webhook.id, error = %err, "sync response is not JSON");
            None
        }
    }
}
