use std::sync::Arc;

use async_trait::async_trait;

use crate::config::WebhookSettings;
use crate::dispatcher::{EntityLoader, NoEntityLoader};
use crate::error::DispatchError;
use crate::event_types::EventRegistry;
use crate::observability::{NoopObservability, ObservabilitySink};
use crate::payload::PayloadGenerator;
use crate::retry::AttemptController;
use crate::router::{EventRouter, WebhookRegistry};
use crate::scheduler::{Envelope, InProcessScheduler, Scheduler, SchedulerConfig, TaskHandler, TaskMessage, TaskOutcome};
use crate::storage::{DeliveryLedger, InMemoryBlobStore, InMemoryLedger, PayloadBlobStore, PayloadStore};
use crate::sync::{CircuitBreaker, ResponseCache};
use crate::transport::{PubSubClient, SqsClient, Transport};

/// Composition root. Cheap to clone; every collaborator is shared.
#[derive(Clone)]
pub struct WebhookEngine {
    pub(crate) settings: Arc<WebhookSettings>,
    pub(crate) router: EventRouter,
    pub(crate) generator: PayloadGenerator,
    pub(crate) webhooks: Arc<WebhookRegistry>,
    pub(crate) ledger: Arc<dyn DeliveryLedger>,
    pub(crate) payloads: PayloadStore,
    pub(crate) transport: Transport,
    pub(crate) attempts: AttemptController,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) loader: Arc<dyn EntityLoader>,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) shipping_cache: Arc<ResponseCache>,
}

impl WebhookEngine {
    pub fn builder(settings: WebhookSettings) -> WebhookEngineBuilder {
        WebhookEngineBuilder::new(settings)
    }

    pub fn settings(&self) -> &WebhookSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<WebhookRegistry> {
        &self.webhooks
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn ledger(&self) -> &Arc<dyn DeliveryLedger> {
        &self.ledger
    }

    pub fn payloads(&self) -> &PayloadStore {
        &self.payloads
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }
}

pub struct WebhookEngineBuilder {
    settings: WebhookSettings,
    registry: Option<Arc<EventRegistry>>,
    webhooks: Option<Arc<WebhookRegistry>>,
    ledger: Option<Arc<dyn DeliveryLedger>>,
    blobs: Option<Arc<dyn PayloadBlobStore>>,
    sqs: Option<Arc<dyn SqsClient>>,
    pubsub: Option<Arc<dyn PubSubClient>>,
    observability: Option<Arc<dyn ObservabilitySink>>,
    loader: Option<Arc<dyn EntityLoader>>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl WebhookEngineBuilder {
    pub fn new(settings: WebhookSettings) -> Self {
        Self {
            settings,
            registry: None,
            webhooks: None,
            ledger: None,
            blobs: None,
            sqs: None,
            pubsub: None,
            observability: None,
            loader: None,
            scheduler: None,
        }
    }

    pub fn with_event_registry(mut self, registry: Arc<EventRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_webhook_registry(mut self, webhooks: Arc<WebhookRegistry>) -> Self {
        self.webhooks = Some(webhooks);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn DeliveryLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_blob_store(mut self, blobs: Arc<dyn PayloadBlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn with_sqs_client(mut self, client: Arc<dyn SqsClient>) -> Self {
        self.sqs = Some(client);
        self
    }

    pub fn with_pubsub_client(mut self, client: Arc<dyn PubSubClient>) -> Self {
        self.pubsub = Some(client);
        self
    }

    pub fn with_observability(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.observability = Some(sink);
        self
    }

    pub fn with_entity_loader(mut self, loader: Arc<dyn EntityLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Assemble the engine. A scheduler must have been supplied.
    pub fn build(mut self) -> Result<WebhookEngine, DispatchError> {
        let scheduler = self
            .scheduler
            .take()
            .ok_or_else(|| DispatchError::Configuration("no scheduler configured".into()))?;
        self.assemble(scheduler)
    }

    /// Assemble the engine on top of a started in-process worker pool.
    pub async fn build_in_process(
        self,
        config: SchedulerConfig,
    ) -> Result<(WebhookEngine, Arc<InProcessScheduler>), DispatchError> {
        let scheduler = Arc::new(InProcessScheduler::new(config, self.settings.queues.all()));
        let engine = self.assemble(scheduler.clone())?;
        scheduler.start(Arc::new(engine.clone())).await;
        Ok((engine, scheduler))
    }

    fn assemble(self, scheduler: Arc<dyn Scheduler>) -> Result<WebhookEngine, DispatchError> {
        let settings = Arc::new(self.settings);
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(EventRegistry::default_registry()));
        let ledger: Arc<dyn DeliveryLedger> = self.ledger.unwrap_or_else(|| Arc::new(InMemoryLedger::new()));
        let blobs: Arc<dyn PayloadBlobStore> = self.blobs.unwrap_or_else(|| Arc::new(InMemoryBlobStore::new()));
        let payloads = PayloadStore::new(ledger.clone(), blobs, settings.payload_inline_limit);
        let observability: Arc<dyn ObservabilitySink> =
            self.observability.unwrap_or_else(|| Arc::new(NoopObservability));

        let mut transport =
            Transport::new(&settings).map_err(|err| DispatchError::Configuration(err.to_string()))?;
        if let Some(sqs) = self.sqs {
            transport = transport.with_sqs_client(sqs);
        }
        if let Some(pubsub) = self.pubsub {
            transport = transport.with_pubsub_client(pubsub);
        }

        let attempts = AttemptController::new(
            ledger.clone(),
            payloads.clone(),
            observability,
            settings.retry_policy.clone(),
            settings.clear_successful_deliveries,
        );

        Ok(WebhookEngine {
            router: EventRouter::new(registry.clone()),
            generator: PayloadGenerator::new(registry, settings.version.clone()),
            webhooks: self.webhooks.unwrap_or_default(),
            ledger,
            payloads,
            transport,
            attempts,
            scheduler,
            loader: self.loader.unwrap_or_else(|| Arc::new(NoEntityLoader)),
            breaker: Arc::new(CircuitBreaker::new(settings.breaker.clone())),
            shipping_cache: Arc::new(ResponseCache::new(settings.shipping_cache_ttl)),
            settings,
        })
    }
}

#[async_trait]
impl TaskHandler for WebhookEngine {
    async fn handle(&self, envelope: &Envelope) -> TaskOutcome {
        match &envelope.task {
            TaskMessage::SendWebhookRequest { delivery_id } => {
                self.send_webhook_request_async(delivery_id, &envelope.id).await
            }
            TaskMessage::GenerateDeferredPayloads {
                event_type,
                object,
                requestor,
                delivery_ids,
            } => {
                self.generate_deferred_payloads(event_type, object, requestor.as_ref(), delivery_ids)
                    .await
            }
            TaskMessage::SendWebhooksForApp { app_id } => self.send_webhooks_async_for_app(app_id, &envelope.id).await,
        }
    }
}
