use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::FailureReason;
use crate::query;

/// Unique identifier for a webhook.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of webhook IDs with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WebhookId(pub String);

/// Unique identifier for an app owning webhooks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppId(pub String);

/// Identifier of a stored event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadId(pub Uuid);

/// Identifier of an event delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

/// Identifier of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(pub Uuid);

macro_rules! uuid_id {
    ($($name:ident),*) => {$(
        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    )*};
}

uuid_id!(PayloadId, DeliveryId, AttemptId);

impl fmt::Display for WebhookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Third-party app registered with the platform.
///
/// Apps own webhooks. A removed or inactive app never receives new
/// deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub id: AppId,
    pub name: String,

    /// Stable identifier chosen by the app developer, used when the caller
    /// asks for a specific app (e.g. a payment gateway).
    pub identifier: Option<String>,
    pub is_active: bool,
    pub removed_at: Option<DateTime<Utc>>,
    pub permissions: Vec<String>,
}

impl App {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: AppId(id.into()),
            name: name.into(),
            identifier: None,
            is_active: true,
            removed_at: None,
            permissions: Vec::new(),
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn removed(mut self) -> Self {
        self.removed_at = Some(Utc::now());
        self
    }

    /// Whether the app may receive new deliveries at all.
    pub fn is_available(&self) -> bool {
        self.is_active && self.removed_at.is_none()
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    pub fn global_id(&self) -> String {
        global_id("App", &self.id.0)
    }
}

/// Destination for webhook delivery.
///
/// The presence of a subscription query routes events through the
/// subscription payload generator instead of the legacy static payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub app_id: AppId,
    pub name: String,

    /// Target URL; its scheme selects the transport.
    pub target_url: String,
    pub is_active: bool,

    /// Secret for HMAC signing. The app-wide default key is used when absent.
    pub secret_key: Option<String>,
    pub subscription_query: Option<String>,

    /// Extra headers merged into outbound requests.
    pub custom_headers: BTreeMap<String, String>,

    /// Event types this webhook is subscribed to.
    pub events: Vec<String>,

    /// Channel slugs named in the subscription document, empty for all.
    pub filterable_channel_slugs: Vec<String>,
}

impl Webhook {
    pub fn new(
        id: impl Into<String>,
        app_id: impl Into<String>,
        target_url: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: WebhookId(id),
            app_id: AppId(app_id.into()),
            target_url: target_url.into(),
            is_active: true,
            secret_key: None,
            subscription_query: None,
            custom_headers: BTreeMap::new(),
            events: Vec::new(),
            filterable_channel_slugs: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_secret_key(mut self, secret_key: impl Into<String>) -> Self {
        self.secret_key = Some(secret_key.into());
        self
    }

    pub fn with_event(mut self, event_type: impl Into<String>) -> Self {
        self.events.push(event_type.into());
        self
    }

    pub fn with_custom_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(name.into(), value.into());
        self
    }

    /// Attach a subscription document. Channel filters are derived from it.
    pub fn with_subscription_query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.filterable_channel_slugs = query::filterable_channel_slugs(&query);
        self.subscription_query = Some(query);
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn has_subscription(&self) -> bool {
        self.subscription_query
            .as_deref()
            .map(|q| !q.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn is_subscribed_to(&self, event_type: &str) -> bool {
        self.events
            .iter()
            .any(|e| e == event_type || e == crate::event_types::ANY_EVENTS)
    }
}

/// Identity that caused the event, carried into payload metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Requestor {
    User { id: String, email: String },
    App { id: AppId, name: String },
}

impl Requestor {
    pub fn model_ref(&self) -> ModelRef {
        match self {
            Requestor::User { id, .. } => ModelRef::new("account.user", id.clone()),
            Requestor::App { id, .. } => ModelRef::new("app.app", id.0.clone()),
        }
    }

    /// GraphQL-shaped `issuingPrincipal` value.
    pub fn principal(&self) -> Value {
        match self {
            Requestor::User { id, email } => serde_json::json!({
                "__typename": "User",
                "id": global_id("User", id),
                "email": email,
            }),
            Requestor::App { id, name } => serde_json::json!({
                "__typename": "App",
                "id": global_id("App", &id.0),
                "name": name,
            }),
        }
    }
}

/// Reference to a persisted row, used by deferred payload generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub model: String,
    pub pk: String,
}

impl ModelRef {
    pub fn new(model: impl Into<String>, pk: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            pk: pk.into(),
        }
    }
}

/// Relay-style global id: base64 of `Type:pk`.
pub fn global_id(type_name: &str, pk: &str) -> String {
    STANDARD.encode(format!("{type_name}:{pk}"))
}

/// A domain entity as seen by subscription documents.
///
/// The collaborator that owns the domain model flattens entities into this
/// shape; nested entities are stored already flattened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub type_name: String,
    pub pk: String,
    pub channel_slug: Option<String>,
    pub fields: Map<String, Value>,
}

impl Entity {
    pub fn new(type_name: impl Into<String>, pk: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            pk: pk.into(),
            channel_slug: None,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_entity(mut self, name: impl Into<String>, entity: &Entity) -> Self {
        self.fields.insert(name.into(), entity.to_value());
        self
    }

    pub fn with_entities(mut self, name: impl Into<String>, entities: &[Entity]) -> Self {
        self.fields.insert(name.into(), Entity::list_value(entities));
        self
    }

    pub fn with_channel(mut self, slug: impl Into<String>) -> Self {
        self.channel_slug = Some(slug.into());
        self
    }

    pub fn global_id(&self) -> String {
        global_id(&self.type_name, &self.pk)
    }

    /// Key identifying the object for caches and idempotence checks.
    pub fn object_key(&self) -> String {
        format!("{}:{}", self.type_name, self.pk)
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(self.fields.len() + 2);
        map.insert("__typename".into(), Value::String(self.type_name.clone()));
        map.insert("id".into(), Value::String(self.global_id()));
        for (key, value) in &self.fields {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map)
    }

    pub fn list_value(entities: &[Entity]) -> Value {
        Value::Array(entities.iter().map(Entity::to_value).collect())
    }
}

/// The object an event is about.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscribablePayload {
    Single(Entity),
    /// Entity plus auxiliary data computed for this event, e.g. a checkout
    /// and the shipping methods available for it.
    WithContext(Entity, Value),
    Many(Vec<Entity>),
    /// The object was deleted before its payload could be generated.
    Deleted(ModelRef),
}

impl SubscribablePayload {
    pub fn object_key(&self) -> String {
        match self {
            SubscribablePayload::Single(entity) | SubscribablePayload::WithContext(entity, _) => {
                entity.object_key()
            }
            SubscribablePayload::Many(entities) => {
                let keys: Vec<String> = entities.iter().map(Entity::object_key).collect();
                format!("[{}]", keys.join(","))
            }
            SubscribablePayload::Deleted(model) => format!("{}:{}", model.model, model.pk),
        }
    }

    pub fn channel_slug(&self) -> Option<&str> {
        match self {
            SubscribablePayload::Single(entity) | SubscribablePayload::WithContext(entity, _) => {
                entity.channel_slug.as_deref()
            }
            SubscribablePayload::Many(_) | SubscribablePayload::Deleted(_) => None,
        }
    }

    pub fn subject_value(&self) -> Value {
        match self {
            SubscribablePayload::Single(entity) | SubscribablePayload::WithContext(entity, _) => {
                entity.to_value()
            }
            SubscribablePayload::Many(entities) => Entity::list_value(entities),
            SubscribablePayload::Deleted(_) => Value::Null,
        }
    }

    pub fn context_value(&self) -> Option<&Value> {
        match self {
            SubscribablePayload::WithContext(_, context) => Some(context),
            _ => None,
        }
    }
}

/// Legacy payload supplied by the caller for webhooks without a
/// subscription document.
pub enum PayloadSource {
    /// Already serialized payload.
    Static(String),

    /// Generator invoked at most once, only when a regular webhook needs it.
    Lazy(Box<dyn FnOnce() -> String + Send>),

    /// Only subscription webhooks are expected.
    Absent,
}

impl PayloadSource {
    pub fn lazy(generator: impl FnOnce() -> String + Send + 'static) -> Self {
        PayloadSource::Lazy(Box::new(generator))
    }

    pub fn resolve(self) -> Option<String> {
        match self {
            PayloadSource::Static(text) => Some(text),
            PayloadSource::Lazy(generator) => Some(generator()),
            PayloadSource::Absent => None,
        }
    }
}

impl fmt::Debug for PayloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadSource::Static(text) => f.debug_tuple("Static").field(text).finish(),
            PayloadSource::Lazy(_) => f.write_str("Lazy(..)"),
            PayloadSource::Absent => f.write_str("Absent"),
        }
    }
}

/// Delivery lifecycle status, shared by deliveries and attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeliveryStatus::Pending),
            "success" => Some(DeliveryStatus::Success),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

/// Serialized event payload. Never mutated once created.
///
/// Exactly one of `payload` (inline) and `payload_file` (blob key) is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub id: PayloadId,
    pub payload: Option<String>,
    pub payload_file: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EventPayload {
    pub fn inline(text: impl Into<String>) -> Self {
        Self {
            id: PayloadId::new(),
            payload: Some(text.into()),
            payload_file: None,
            created_at: Utc::now(),
        }
    }

    pub fn blob(id: PayloadId, key: impl Into<String>) -> Self {
        Self {
            id,
            payload: None,
            payload_file: Some(key.into()),
            created_at: Utc::now(),
        }
    }
}

/// One (event, webhook) pairing awaiting or having undergone delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDelivery {
    pub id: DeliveryId,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub event_type: String,
    pub payload_id: Option<PayloadId>,
    pub webhook_id: WebhookId,
}

impl EventDelivery {
    pub fn new(event_type: impl Into<String>, webhook_id: WebhookId, payload_id: Option<PayloadId>) -> Self {
        Self {
            id: DeliveryId::new(),
            created_at: Utc::now(),
            status: DeliveryStatus::Pending,
            event_type: event_type.into(),
            payload_id,
            webhook_id,
        }
    }
}

/// One network round-trip within a delivery's retry series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDeliveryAttempt {
    pub id: AttemptId,
    pub delivery_id: Option<DeliveryId>,
    pub created_at: DateTime<Utc>,
    pub task_id: Option<String>,

    /// Seconds.
    pub duration: Option<f64>,
    pub response: Option<String>,
    pub response_headers: Option<String>,
    pub response_status_code: Option<u16>,
    pub request_headers: Option<String>,
    pub status: DeliveryStatus,
}

impl EventDeliveryAttempt {
    pub fn pending(delivery_id: DeliveryId, task_id: Option<String>) -> Self {
        Self {
            id: AttemptId::new(),
            delivery_id: Some(delivery_id),
            created_at: Utc::now(),
            task_id,
            duration: None,
            response: None,
            response_headers: None,
            response_status_code: None,
            request_headers: None,
            status: DeliveryStatus::Pending,
        }
    }
}

/// Result of one transport call.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
    pub content: String,
    pub request_headers: BTreeMap<String, String>,
    pub response_headers: BTreeMap<String, String>,
    pub status: DeliveryStatus,
    pub status_code: Option<u16>,
    pub duration: Duration,

    /// Set for every failed response.
    pub failure: Option<FailureReason>,
}

impl WebhookResponse {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            request_headers: BTreeMap::new(),
            response_headers: BTreeMap::new(),
            status: DeliveryStatus::Success,
            status_code: None,
            duration: Duration::ZERO,
            failure: None,
        }
    }

    pub fn failed(reason: FailureReason, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            request_headers: BTreeMap::new(),
            response_headers: BTreeMap::new(),
            status: DeliveryStatus::Failed,
            status_code: None,
            duration: Duration::ZERO,
            failure: Some(reason),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DeliveryStatus::Success
    }

    pub fn is_retryable(&self) -> bool {
        match self.failure {
            Some(reason) => reason.is_retryable(),
            None => false,
        }
    }
}
