use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::event_types::EventRegistry;
use crate::types::{App, AppId, SubscribablePayload, Webhook, WebhookId};

/// Webhooks of one event, split by payload strategy.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RoutedWebhooks {
    /// Receive the caller-supplied static payload.
    pub regular: Vec<Webhook>,

    /// Receive a payload generated from their subscription document.
    pub subscription: Vec<Webhook>,
}

impl RoutedWebhooks {
    pub fn is_empty(&self) -> bool {
        self.regular.is_empty() && self.subscription.is_empty()
    }
}

/// Split webhooks into (regular, subscription), keeping input order.
pub fn group_webhooks_by_subscription(webhooks: &[Webhook]) -> (Vec<Webhook>, Vec<Webhook>) {
    webhooks.iter().cloned().partition(|w| !w.has_subscription())
}

/// Whether a webhook's channel filter lets an object of `channel_slug` through.
pub fn channel_matches(webhook: &Webhook, channel_slug: Option<&str>) -> bool {
    match channel_slug {
        Some(slug) if !webhook.filterable_channel_slugs.is_empty() => {
            webhook.filterable_channel_slugs.iter().any(|s| s == slug)
        }
        _ => true,
    }
}

#[derive(Debug, Clone)]
pub struct EventRouter {
    registry: Arc<EventRegistry>,
}

impl EventRouter {
    pub fn new(registry: Arc<EventRegistry>) -> Self {
        Self { registry }
    }

    pub fn is_subscribable(&self, event_type: &str) -> bool {
        self.registry.is_subscribable(event_type)
    }

    /// Group webhooks for one event and object.
    ///
    /// Subscription webhooks are dropped when the event has no subscription
    /// type, or when their channel filter excludes the object.
    pub fn route(&self, event_type: &str, webhooks: &[Webhook], subscribable: Option<&SubscribablePayload>) -> RoutedWebhooks {
        let (regular, subscription) = group_webhooks_by_subscription(webhooks);

        if !subscription.is_empty() && !self.is_subscribable(event_type) {
            tracing::warn!(
                event_type,
                skipped = subscription.len(),
                "event type is not subscribable, skipping subscription webhooks"
            );
            return RoutedWebhooks {
                regular,
                subscription: Vec::new(),
            };
        }

        let channel_slug = subscribable.and_then(SubscribablePayload::channel_slug);
        let subscription = subscription
            .into_iter()
            .filter(|webhook| {
                let keep = channel_matches(webhook, channel_slug);
                if !keep {
                    tracing::debug!(
                        event_type,
                        webhook_id = %webhook.id,
                        channel = channel_slug.unwrap_or_default(),
                        "webhook filtered out by channel"
                    );
                }
                keep
            })
            .collect();

        RoutedWebhooks { regular, subscription }
    }

    /// Active webhooks subscribed to `event_type` whose app may receive it.
    pub fn webhooks_for_event<'a, I>(&self, event_type: &str, webhooks: I, apps: &HashMap<AppId, App>) -> Vec<Webhook>
    where
        I: IntoIterator<Item = &'a Webhook>,
    {
        let permission = self.registry.get(event_type).and_then(|spec| spec.permission.as_deref());
        webhooks
            .into_iter()
            .filter(|webhook| webhook.is_active && webhook.is_subscribed_to(event_type))
            .filter(|webhook| match apps.get(&webhook.app_id) {
                Some(app) => app.is_available() && permission.map(|p| app.has_permission(p)).unwrap_or(true),
                None => false,
            })
            .cloned()
            .collect()
    }
}

/// Known apps and their webhooks.
#[derive(Debug, Default)]
pub struct WebhookRegistry {
    apps: RwLock<HashMap<AppId, App>>,
    webhooks: RwLock<Vec<Webhook>>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_app(&self, app: App) {
        self.apps.write().await.insert(app.id.clone(), app);
    }

    /// Adds or replaces a webhook, keeping registration order.
    pub async fn register_webhook(&self, webhook: Webhook) {
        let mut guard = self.webhooks.write().await;
        match guard.iter_mut().find(|w| w.id == webhook.id) {
            Some(existing) => *existing = webhook,
            None => guard.push(webhook),
        }
    }

    pub async fn app(&self, id: &AppId) -> Option<App> {
        self.apps.read().await.get(id).cloned()
    }

    pub async fn apps(&self) -> HashMap<AppId, App> {
        self.apps.read().await.clone()
    }

    pub async fn webhook(&self, id: &WebhookId) -> Option<Webhook> {
        self.webhooks.read().await.iter().find(|w| &w.id == id).cloned()
    }

    pub async fn webhooks(&self) -> Vec<Webhook> {
        self.webhooks.read().await.clone()
    }

    pub async fn webhooks_for_app(&self, app_id: &AppId) -> Vec<Webhook> {
        self.webhooks
            .read()
            .await
            .iter()
            .filter(|w| &w.app_id == app_id)
            .cloned()
            .collect()
    }

    /// Webhook together with its owning app, when the app may still receive
    /// deliveries.
    pub async fn deliverable(&self, id: &WebhookId) -> Option<(Webhook, App)> {
        let webhook = self.webhook(id).await?;
        let app = self.app(&webhook.app_id).await?;
        app.is_available().then_some((webhook, app))
    }

    pub async fn mark_app_removed(&self, id: &AppId) -> bool {
        let mut guard = self.apps.write().await;
        match guard.get_mut(id) {
            Some(app) => {
                app.removed_at = Some(chrono::Utc::now());
                true
            }
            None => false,
        }
    }

    pub async fn set_app_active(&self, id: &AppId, is_active: bool) -> bool {
        let mut guard = self.apps.write().await;
        match guard.get_mut(id) {
            Some(app) => {
                app.is_active = is_active;
                true
            }
            None => false,
        }
    }
}
