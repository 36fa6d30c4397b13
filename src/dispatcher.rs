//! Asynchronous fan-out.
//!
//! Deliveries and payloads are persisted first; only delivery ids travel
//! through the task queues and workers re-read payloads from the store.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::WebhookEngine;
use crate::error::{DispatchError, LedgerError};
use crate::observability::{metric_inc, metric_inc_event};
use crate::payload::{GenerationCache, PreSavePayloads};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::scheduler::{TaskMessage, TaskOutcome};
use crate::transport::{queue_for_target, OutboundRequest};
use crate::types::{
    App, AppId, DeliveryId, DeliveryStatus, EventDelivery, EventPayload, ModelRef, PayloadSource, Requestor,
    SubscribablePayload, Webhook, WebhookId,
};

/// Loads domain objects for deferred payload generation.
#[async_trait]
pub trait EntityLoader: Send + Sync {
    /// `None` when the row no longer exists.
    async fn load(&self, event_type: &str, object: &ModelRef) -> Option<SubscribablePayload>;

    async fn requestor(&self, _requestor: &ModelRef) -> Option<Requestor> {
        None
    }
}

/// Loader for deployments that never defer payload generation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEntityLoader;

#[async_trait]
impl EntityLoader for NoEntityLoader {
    async fn load(&self, _event_type: &str, _object: &ModelRef) -> Option<SubscribablePayload> {
        None
    }
}

/// One object of a bulk event with the static payload for regular webhooks.
#[derive(Debug)]
pub struct ObjectPayload {
    pub subscribable: SubscribablePayload,
    pub source: PayloadSource,
}

impl ObjectPayload {
    pub fn new(subscribable: SubscribablePayload, source: PayloadSource) -> Self {
        Self { subscribable, source }
    }
}

impl WebhookEngine {
    /// Fan one event out to `webhooks` and schedule delivery.
    ///
    /// Regular webhooks share one payload built from `source`, which is only
    /// resolved when at least one regular webhook remains after routing.
    pub async fn trigger_webhooks_async(
        &self,
        event_type: &str,
        webhooks: &[Webhook],
        source: PayloadSource,
        subscribable: Option<&SubscribablePayload>,
        requestor: Option<&Requestor>,
        pre_save: Option<&PreSavePayloads>,
    ) -> Result<Vec<EventDelivery>, DispatchError> {
        let (webhooks, apps) = self.available_webhooks(webhooks).await;
        let routed = self.router.route(event_type, &webhooks, subscribable);
        if routed.is_empty() {
            tracing::debug!(event_type, "no webhooks to deliver to");
            return Ok(Vec::new());
        }

        let mut deliveries = Vec::new();
        if !routed.regular.is_empty() {
            let text = source.resolve().ok_or_else(|| DispatchError::MissingPayload {
                event_type: event_type.to_string(),
            })?;
            let payload = self.payloads.prepare(text).await?;
            self.ledger.bulk_save_payloads(std::slice::from_ref(&payload)).await?;
            let regular: Vec<EventDelivery> = routed
                .regular
                .iter()
                .map(|webhook| EventDelivery::new(event_type, webhook.id.clone(), Some(payload.id)))
                .collect();
            self.ledger.bulk_create_deliveries(&regular).await?;
            deliveries.extend(regular);
        }

        if !routed.subscription.is_empty() {
            match subscribable {
                Some(subscribable) => {
                    let created = self
                        .create_subscription_deliveries(event_type, subscribable, &routed.subscription, &apps, requestor, pre_save)
                        .await?;
                    deliveries.extend(created);
                }
                None => tracing::warn!(
                    event_type,
                    skipped = routed.subscription.len(),
                    "no subscribable object supplied for subscription webhooks"
                ),
            }
        }

        metric_inc_event("webhook.fanout.deliveries", event_type);
        tracing::info!(event_type, deliveries = deliveries.len(), "webhook deliveries created");
        self.schedule_deliveries(&deliveries, &webhooks).await?;
        Ok(deliveries)
    }

    /// Generate payloads and persist deliveries for subscription webhooks
    /// without scheduling them.
    pub async fn create_deliveries_for_subscriptions(
        &self,
        event_type: &str,
        subscribable: &SubscribablePayload,
        webhooks: &[Webhook],
        requestor: Option<&Requestor>,
        pre_save: Option<&PreSavePayloads>,
    ) -> Result<Vec<EventDelivery>, DispatchError> {
        if !self.router.is_subscribable(event_type) {
            tracing::warn!(event_type, "event type is not subscribable");
            return Ok(Vec::new());
        }
        let apps = self.webhooks.apps().await;
        self.create_subscription_deliveries(event_type, subscribable, webhooks, &apps, requestor, pre_save)
            .await
    }

    /// Snapshot subscription payloads before a mutation so that unchanged
    /// objects produce no deliveries afterwards.
    pub async fn generate_pre_save_payloads(
        &self,
        event_type: &str,
        webhooks: &[Webhook],
        subscribable: &SubscribablePayload,
        requestor: Option<&Requestor>,
    ) -> PreSavePayloads {
        let (webhooks, apps) = self.available_webhooks(webhooks).await;
        let routed = self.router.route(event_type, &webhooks, Some(subscribable));
        let mut cache = GenerationCache::new();
        let mut snapshots = PreSavePayloads::new();
        for webhook in &routed.subscription {
            if let Some(value) = self.generate_for(event_type, subscribable, webhook, &apps, requestor, &mut cache) {
                snapshots.insert((webhook.id.clone(), subscribable.object_key()), value);
            }
        }
        snapshots
    }

    /// Create payload-less deliveries and defer generation to a worker.
    pub async fn trigger_webhooks_deferred(
        &self,
        event_type: &str,
        webhooks: &[Webhook],
        object: ModelRef,
        requestor: Option<ModelRef>,
    ) -> Result<Vec<EventDelivery>, DispatchError> {
        let (webhooks, _) = self.available_webhooks(webhooks).await;
        let routed = self.router.route(event_type, &webhooks, None);
        if !routed.regular.is_empty() {
            tracing::debug!(
                event_type,
                skipped = routed.regular.len(),
                "deferred payloads only apply to subscription webhooks"
            );
        }
        if routed.subscription.is_empty() {
            return Ok(Vec::new());
        }

        let deliveries: Vec<EventDelivery> = routed
            .subscription
            .iter()
            .map(|webhook| EventDelivery::new(event_type, webhook.id.clone(), None))
            .collect();
        self.ledger.bulk_create_deliveries(&deliveries).await?;

        let task = TaskMessage::GenerateDeferredPayloads {
            event_type: event_type.to_string(),
            object,
            requestor,
            delivery_ids: deliveries.iter().map(|d| d.id).collect(),
        };
        self.scheduler
            .enqueue(task, &self.settings.queues.payloads, &RetryPolicy::no_retry())
            .await?;
        Ok(deliveries)
    }

    /// Fan out an event concerning many objects, one delivery per
    /// (object, webhook), persisted in bounded chunks.
    pub async fn trigger_webhooks_for_objects(
        &self,
        event_type: &str,
        webhooks: &[Webhook],
        objects: Vec<ObjectPayload>,
        requestor: Option<&Requestor>,
    ) -> Result<Vec<EventDelivery>, DispatchError> {
        let (webhooks, apps) = self.available_webhooks(webhooks).await;
        let mut cache = GenerationCache::new();
        let mut payloads: Vec<EventPayload> = Vec::new();
        let mut deliveries: Vec<EventDelivery> = Vec::new();

        for object in objects {
            let routed = self.router.route(event_type, &webhooks, Some(&object.subscribable));

            if !routed.regular.is_empty() {
                let text = object.source.resolve().ok_or_else(|| DispatchError::MissingPayload {
                    event_type: event_type.to_string(),
                })?;
                let payload = self.payloads.prepare(text).await?;
                for webhook in &routed.regular {
                    deliveries.push(EventDelivery::new(event_type, webhook.id.clone(), Some(payload.id)));
                }
                payloads.push(payload);
            }

            for webhook in &routed.subscription {
                let Some(value) =
                    self.generate_for(event_type, &object.subscribable, webhook, &apps, requestor, &mut cache)
                else {
                    continue;
                };
                let payload = self.payloads.prepare(serde_json::to_string(&value)?).await?;
                deliveries.push(EventDelivery::new(event_type, webhook.id.clone(), Some(payload.id)));
                payloads.push(payload);
            }
        }

        let chunk_size = self.settings.max_objects_per_bulk_insert.max(1);
        for chunk in payloads.chunks(chunk_size) {
            self.ledger.bulk_save_payloads(chunk).await?;
        }
        for chunk in deliveries.chunks(chunk_size) {
            self.ledger.bulk_create_deliveries(chunk).await?;
        }
        tracing::info!(event_type, deliveries = deliveries.len(), "bulk webhook deliveries created");

        self.schedule_deliveries(&deliveries, &webhooks).await?;
        Ok(deliveries)
    }

    /// Webhooks that are active and whose app may receive deliveries, with
    /// their apps.
    async fn available_webhooks(&self, webhooks: &[Webhook]) -> (Vec<Webhook>, HashMap<AppId, App>) {
        let apps = self.webhooks.apps().await;
        let available = webhooks
            .iter()
            .filter(|webhook| {
                let keep = webhook.is_active
                    && apps
                        .get(&webhook.app_id)
                        .map(App::is_available)
                        .unwrap_or(false);
                if !keep {
                    tracing::debug!(webhook_id = %webhook.id, app_id = %webhook.app_id, "skipping unavailable webhook");
                    metric_inc("webhook.fanout.skipped");
                }
                keep
            })
            .cloned()
            .collect();
        (available, apps)
    }

    async fn create_subscription_deliveries(
        &self,
        event_type: &str,
        subscribable: &SubscribablePayload,
        webhooks: &[Webhook],
        apps: &HashMap<AppId, App>,
        requestor: Option<&Requestor>,
        pre_save: Option<&PreSavePayloads>,
    ) -> Result<Vec<EventDelivery>, DispatchError> {
        let mut cache = GenerationCache::new();
        let mut payloads = Vec::new();
        let mut deliveries = Vec::new();
        let object_key = subscribable.object_key();

        for webhook in webhooks {
            let Some(value) = self.generate_for(event_type, subscribable, webhook, apps, requestor, &mut cache) else {
                continue;
            };
            if let Some(previous) = pre_save.and_then(|p| p.get(&(webhook.id.clone(), object_key.clone()))) {
                if previous == &value {
                    tracing::debug!(event_type, webhook_id = %webhook.id, "payload unchanged, skipping delivery");
                    metric_inc("webhook.fanout.unchanged");
                    continue;
                }
            }
            let payload = self.payloads.prepare(serde_json::to_string(&value)?).await?;
            deliveries.push(EventDelivery::new(event_type, webhook.id.clone(), Some(payload.id)));
            payloads.push(payload);
        }

        if !deliveries.is_empty() {
            self.ledger.bulk_save_payloads(&payloads).await?;
            self.ledger.bulk_create_deliveries(&deliveries).await?;
        }
        Ok(deliveries)
    }

    /// Run a webhook's subscription document. Failures are logged and
    /// produce no payload.
    fn generate_for(
        &self,
        event_type: &str,
        subscribable: &SubscribablePayload,
        webhook: &Webhook,
        apps: &HashMap<AppId, App>,
        requestor: Option<&Requestor>,
        cache: &mut GenerationCache,
    ) -> Option<Value> {
        let query = webhook.subscription_query.as_deref()?;
        match self
            .generator
            .generate(event_type, subscribable, query, cache, requestor, apps.get(&webhook.app_id))
        {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(event_type, webhook_id = %webhook.id, error = %err, "subscription payload generation failed");
                None
            }
        }
    }

    async fn schedule_deliveries(&self, deliveries: &[EventDelivery], webhooks: &[Webhook]) -> Result<(), DispatchError> {
        let by_id: HashMap<&WebhookId, &Webhook> = webhooks.iter().map(|w| (&w.id, w)).collect();

        if self.settings.batch_by_app {
            let app_ids: BTreeSet<&AppId> = deliveries
                .iter()
                .filter_map(|d| by_id.get(&d.webhook_id))
                .map(|w| &w.app_id)
                .collect();
            for app_id in app_ids {
                self.scheduler
                    .enqueue(
                        TaskMessage::SendWebhooksForApp { app_id: app_id.clone() },
                        &self.settings.queues.http,
                        &self.drain_policy(),
                    )
                    .await?;
            }
            return Ok(());
        }

        for delivery in deliveries {
            let queue = match by_id.get(&delivery.webhook_id) {
                Some(webhook) => queue_for_target(&webhook.target_url, &self.settings.queues),
                None => self.settings.queues.http.as_str(),
            };
            self.scheduler
                .enqueue(
                    TaskMessage::SendWebhookRequest { delivery_id: delivery.id },
                    queue,
                    &self.settings.retry_policy,
                )
                .await?;
        }
        Ok(())
    }

    /// Worker side of `SendWebhookRequest`.
    pub async fn send_webhook_request_async(&self, delivery_id: &DeliveryId, task_id: &str) -> TaskOutcome {
        let delivery = match self.ledger.delivery(delivery_id).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                tracing::debug!(delivery_id = %delivery_id, "delivery no longer exists");
                return TaskOutcome::Done;
            }
            Err(err) => return self.ledger_failure(err, 1),
        };
        match self.deliver(&delivery, task_id).await {
            Ok(RetryDecision::Retry(countdown)) => TaskOutcome::Retry { countdown },
            Ok(RetryDecision::GiveUp) => TaskOutcome::Done,
            Err(err) => self.ledger_failure(err, 1),
        }
    }

    /// Make one attempt for a pending delivery.
    async fn deliver(&self, delivery: &EventDelivery, task_id: &str) -> Result<RetryDecision, LedgerError> {
        if delivery.status.is_terminal() {
            return Ok(RetryDecision::GiveUp);
        }
        let Some(webhook) = self.webhooks.webhook(&delivery.webhook_id).await else {
            tracing::warn!(delivery_id = %delivery.id, webhook_id = %delivery.webhook_id, "webhook is gone");
            self.ledger.set_delivery_status(&delivery.id, DeliveryStatus::Failed).await?;
            return Ok(RetryDecision::GiveUp);
        };
        let removed = self
            .webhooks
            .app(&webhook.app_id)
            .await
            .map(|app| app.removed_at.is_some())
            .unwrap_or(true);
        if removed {
            tracing::info!(delivery_id = %delivery.id, app_id = %webhook.app_id, "app removed, dropping delivery");
            self.ledger.set_delivery_status(&delivery.id, DeliveryStatus::Failed).await?;
            return Ok(RetryDecision::GiveUp);
        }

        let Some(payload_id) = delivery.payload_id else {
            tracing::warn!(delivery_id = %delivery.id, "delivery has no payload");
            self.ledger.set_delivery_status(&delivery.id, DeliveryStatus::Failed).await?;
            return Ok(RetryDecision::GiveUp);
        };
        let Some(text) = self.payloads.load(&payload_id).await? else {
            tracing::warn!(delivery_id = %delivery.id, payload_id = %payload_id, "payload is missing");
            self.ledger.set_delivery_status(&delivery.id, DeliveryStatus::Failed).await?;
            return Ok(RetryDecision::GiveUp);
        };

        let request = OutboundRequest::for_webhook(&webhook, delivery.event_type.clone(), text, self.settings.http_timeout)
            .with_payload_id(payload_id);
        let attempt = self.attempts.begin(delivery, Some(task_id.to_string())).await?;
        let response = self.transport.send(&request).await;
        self.attempts.finish(delivery, attempt, &response).await?;

        if response.is_success() {
            tracing::info!(
                delivery_id = %delivery.id,
                webhook_id = %webhook.id,
                event_type = %delivery.event_type,
                "webhook delivered"
            );
            self.attempts.handle_success(delivery).await?;
            return Ok(RetryDecision::GiveUp);
        }
        self.attempts.handle_failure(delivery, &response).await
    }

    fn ledger_failure(&self, err: LedgerError, attempt: u32) -> TaskOutcome {
        tracing::error!(error = %err, "ledger error while delivering webhook");
        TaskOutcome::Retry {
            countdown: self.settings.retry_policy.countdown(attempt),
        }
    }

    /// Worker side of `GenerateDeferredPayloads`.
    pub async fn generate_deferred_payloads(
        &self,
        event_type: &str,
        object: &ModelRef,
        requestor: Option<&ModelRef>,
        delivery_ids: &[DeliveryId],
    ) -> TaskOutcome {
        match self
            .try_generate_deferred_payloads(event_type, object, requestor, delivery_ids)
            .await
        {
            Ok(()) => TaskOutcome::Done,
            Err(err) => {
                tracing::error!(event_type, error = %err, "deferred payload generation failed");
                TaskOutcome::Done
            }
        }
    }

    async fn try_generate_deferred_payloads(
        &self,
        event_type: &str,
        object: &ModelRef,
        requestor: Option<&ModelRef>,
        delivery_ids: &[DeliveryId],
    ) -> Result<(), DispatchError> {
        let Some(subscribable) = self.loader.load(event_type, object).await else {
            tracing::info!(event_type, model = %object.model, pk = %object.pk, "object is gone, failing deliveries");
            for id in delivery_ids {
                self.fail_pending(id).await?;
            }
            return Ok(());
        };
        let requestor = match requestor {
            Some(reference) => self.loader.requestor(reference).await,
            None => None,
        };

        let apps = self.webhooks.apps().await;
        let mut cache = GenerationCache::new();
        let mut ready = Vec::new();
        let mut webhooks = Vec::new();
        for id in delivery_ids {
            let Some(delivery) = self.ledger.delivery(id).await? else {
                continue;
            };
            if delivery.status.is_terminal() {
                continue;
            }
            let Some(webhook) = self.webhooks.webhook(&delivery.webhook_id).await else {
                self.fail_pending(id).await?;
                continue;
            };
            let value = self.generate_for(event_type, &subscribable, &webhook, &apps, requestor.as_ref(), &mut cache);
            let Some(value) = value else {
                self.fail_pending(id).await?;
                continue;
            };
            let payload = self.payloads.create(serde_json::to_string(&value)?).await?;
            self.ledger.set_delivery_payload(id, &payload.id).await?;
            ready.push(EventDelivery {
                payload_id: Some(payload.id),
                ..delivery
            });
            webhooks.push(webhook);
        }

        self.schedule_deliveries(&ready, &webhooks).await
    }

    async fn fail_pending(&self, id: &DeliveryId) -> Result<(), LedgerError> {
        match self.ledger.set_delivery_status(id, DeliveryStatus::Failed).await {
            Ok(()) | Err(LedgerError::NotFound { .. }) | Err(LedgerError::InvalidTransition { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Every run of an app drain makes at least one attempt, so the task
    /// budget covers all attempts of a full batch.
    fn drain_policy(&self) -> RetryPolicy {
        let policy = &self.settings.retry_policy;
        RetryPolicy {
            max_attempts: policy
                .max_attempts
                .saturating_mul(self.settings.pending_batch_size.max(1).try_into().unwrap_or(u32::MAX)),
            ..policy.clone()
        }
    }

    /// Worker side of `SendWebhooksForApp`: one attempt for each pending
    /// delivery of the app, up to the batch size.
    pub async fn send_webhooks_async_for_app(&self, app_id: &AppId, task_id: &str) -> TaskOutcome {
        let available = self.webhooks.app(app_id).await.map(|a| a.is_available()).unwrap_or(false);
        if !available {
            tracing::debug!(app_id = %app_id, "app unavailable, nothing to send");
            return TaskOutcome::Done;
        }
        let webhook_ids: Vec<WebhookId> = self
            .webhooks
            .webhooks_for_app(app_id)
            .await
            .into_iter()
            .filter(|w| w.is_active)
            .map(|w| w.id)
            .collect();
        if webhook_ids.is_empty() {
            return TaskOutcome::Done;
        }

        let batch_size = self.settings.pending_batch_size.max(1);
        let pending = match self.ledger.pending_deliveries(&webhook_ids, batch_size).await {
            Ok(pending) => pending,
            Err(err) => return self.ledger_failure(err, 1),
        };

        let mut sent = 0;
        let mut next_retry: Option<std::time::Duration> = None;
        for delivery in &pending {
            match self.attempts.retry_wait(delivery).await {
                Ok(None) => {}
                Ok(Some(wait)) => {
                    next_retry = Some(next_retry.map_or(wait, |c| c.min(wait)));
                    continue;
                }
                Err(err) => {
                    tracing::error!(delivery_id = %delivery.id, error = %err, "cannot read attempts while draining app");
                    continue;
                }
            }
            sent += 1;
            match self.deliver(delivery, task_id).await {
                Ok(RetryDecision::Retry(countdown)) => {
                    next_retry = Some(next_retry.map_or(countdown, |c| c.min(countdown)));
                }
                Ok(RetryDecision::GiveUp) => {}
                Err(err) => tracing::error!(delivery_id = %delivery.id, error = %err, "ledger error while draining app"),
            }
        }
        tracing::info!(app_id = %app_id, sent, waiting = pending.len() - sent, "drained pending deliveries");

        // A batch made only of due deliveries may hide more behind it.
        if sent == batch_size {
            let task = TaskMessage::SendWebhooksForApp { app_id: app_id.clone() };
            if let Err(err) = self
                .scheduler
                .enqueue(task, &self.settings.queues.http, &self.drain_policy())
                .await
            {
                tracing::warn!(app_id = %app_id, error = %err, "cannot re-enqueue app drain");
            }
            return TaskOutcome::Done;
        }
        match next_retry {
            Some(countdown) => TaskOutcome::Retry { countdown },
            None => TaskOutcome::Done,
        }
    }
}
