//! Subscription payload generation.
//!
//! A webhook's subscription document is evaluated against an event object
//! built from the subscribable entity. The result is the `data` of the
//! subscription root field, which becomes the delivered JSON payload.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::error::QueryError;
use crate::event_types::{EventRegistry, WebhookEventSpec};
use crate::query::{parse_subscription, Field, SelectionSet, Selection, SubscriptionDocument, MAX_NESTING};
use crate::types::{App, Requestor, SubscribablePayload, WebhookId};

/// Error message placed in payloads that select a field unavailable while the
/// event is evaluated synchronously.
pub const SYNC_FIELD_NOT_ALLOWED: &str = "Resolving this field is not allowed in synchronous events.";

/// Payloads captured before a save, keyed by webhook and object.
///
/// A post-save payload equal to its pre-save snapshot produces no delivery.
pub type PreSavePayloads = HashMap<(WebhookId, String), Value>;

/// Event object shared by every webhook evaluated for the same event and
/// subscribable object during one fan-out.
#[derive(Debug)]
pub struct ExecutionContext {
    pub event_type: String,
    pub issued_at: DateTime<Utc>,
    root: Map<String, Value>,
}

/// Caches held for the duration of one fan-out.
#[derive(Debug, Default)]
pub struct GenerationCache {
    contexts: HashMap<(String, String), Arc<ExecutionContext>>,
    documents: HashMap<String, Arc<SubscriptionDocument>>,
}

impl GenerationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of event objects built so far.
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    fn document(&mut self, query: &str) -> Result<Arc<SubscriptionDocument>, QueryError> {
        if let Some(document) = self.documents.get(query) {
            return Ok(document.clone());
        }
        let document = Arc::new(parse_subscription(query)?);
        self.documents.insert(query.to_string(), document.clone());
        Ok(document)
    }
}

#[derive(Debug, Clone)]
pub struct PayloadGenerator {
    registry: Arc<EventRegistry>,
    version: Arc<str>,
}

impl PayloadGenerator {
    pub fn new(registry: Arc<EventRegistry>, version: impl Into<String>) -> Self {
        Self {
            registry,
            version: Arc::from(version.into()),
        }
    }

    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    /// Evaluate `query` for `event_type` against `subscribable`.
    ///
    /// `Ok(None)` means nothing was selected for this event, or the subject
    /// was deleted, and no delivery should be created.
    pub fn generate(
        &self,
        event_type: &str,
        subscribable: &SubscribablePayload,
        query: &str,
        cache: &mut GenerationCache,
        requestor: Option<&Requestor>,
        app: Option<&App>,
    ) -> Result<Option<Value>, QueryError> {
        let spec = self
            .registry
            .get(event_type)
            .ok_or_else(|| QueryError::UnknownEvent(event_type.to_string()))?;
        let document = cache.document(query)?;
        if let SubscribablePayload::Deleted(model) = subscribable {
            tracing::debug!(event_type, model = %model.model, pk = %model.pk, "subject deleted, no payload");
            return Ok(None);
        }

        let key = (event_type.to_string(), subscribable.object_key());
        let context = match cache.contexts.get(&key) {
            Some(context) => context.clone(),
            None => {
                let context = Arc::new(self.build_context(spec, subscribable, requestor));
                cache.contexts.insert(key, context.clone());
                context
            }
        };

        let Some(root_field) = document.root_field() else {
            return Ok(None);
        };
        if !selects_event(root_field, spec) {
            tracing::debug!(
                event_type,
                root_field = %root_field.name,
                "subscription root field does not match event"
            );
            return Ok(None);
        }

        let recipient = app
            .map(|app| {
                json!({
                    "__typename": "App",
                    "id": app.global_id(),
                    "name": app.name,
                })
            })
            .unwrap_or(Value::Null);
        let source = EventSource {
            root: &context.root,
            recipient: &recipient,
        };

        let forbidden: &[String] = if spec.is_sync {
            &spec.sync_forbidden_fields
        } else {
            &[]
        };
        let mut projector = Projector {
            document: &document,
            forbidden,
            errors: Vec::new(),
            nulled: Vec::new(),
            depth: 0,
        };

        let mut out = Map::new();
        let mut path = Vec::new();
        projector.project(&root_field.selection, &source, &mut path, &mut out)?;

        if out.is_empty() {
            return Ok(None);
        }
        for key in &projector.nulled {
            if let Some(value) = out.get_mut(key) {
                *value = Value::Null;
            }
        }
        if !projector.errors.is_empty() {
            out.insert("errors".into(), Value::Array(projector.errors));
        }
        Ok(Some(Value::Object(out)))
    }

    fn build_context(
        &self,
        spec: &WebhookEventSpec,
        subscribable: &SubscribablePayload,
        requestor: Option<&Requestor>,
    ) -> ExecutionContext {
        let issued_at = Utc::now();
        let mut root = Map::new();
        root.insert("__typename".into(), Value::String(spec.subscription_type.clone()));
        root.insert(spec.subject_field.clone(), subscribable.subject_value());
        if let Some(field) = &spec.context_field {
            root.insert(
                field.clone(),
                subscribable.context_value().cloned().unwrap_or(Value::Null),
            );
        }
        root.insert("issuedAt".into(), Value::String(issued_at.to_rfc3339()));
        root.insert("version".into(), Value::String(self.version.to_string()));
        root.insert(
            "issuingPrincipal".into(),
            requestor.map(Requestor::principal).unwrap_or(Value::Null),
        );
        ExecutionContext {
            event_type: spec.event_type.clone(),
            issued_at,
            root,
        }
    }
}

/// `event { ... on X }` or the event-named root field (`orderCreated`).
fn selects_event(root_field: &Field, spec: &WebhookEventSpec) -> bool {
    root_field.name == "event" || root_field.name == lower_camel(&spec.subscription_type)
}

fn lower_camel(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

trait FieldSource {
    fn type_name(&self) -> Option<&str>;
    fn field(&self, name: &str) -> Option<&Value>;
}

impl FieldSource for Map<String, Value> {
    fn type_name(&self) -> Option<&str> {
        self.get("__typename").and_then(Value::as_str)
    }

    fn field(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

struct EventSource<'a> {
    root: &'a Map<String, Value>,
    recipient: &'a Value,
}

impl FieldSource for EventSource<'_> {
    fn type_name(&self) -> Option<&str> {
        self.root.type_name()
    }

    fn field(&self, name: &str) -> Option<&Value> {
        if name == "recipient" {
            Some(self.recipient)
        } else {
            self.root.get(name)
        }
    }
}

struct Projector<'a> {
    document: &'a SubscriptionDocument,
    forbidden: &'a [String],
    errors: Vec<Value>,

    /// Top-level response keys nulled by a forbidden selection.
    nulled: Vec<String>,

    /// Selection sets entered so far, fragment spreads included.
    depth: usize,
}

/// (field name, response key) pairs from the event object down.
type FieldPath = Vec<(String, String)>;

impl Projector<'_> {
    fn project(
        &mut self,
        selection: &SelectionSet,
        source: &dyn FieldSource,
        path: &mut FieldPath,
        out: &mut Map<String, Value>,
    ) -> Result<(), QueryError> {
        // Named fragments each pass the parser's limit on their own.
        if self.depth >= MAX_NESTING {
            return Err(QueryError::NestingTooDeep { max_depth: MAX_NESTING });
        }
        self.depth += 1;
        let result = self.project_items(selection, source, path, out);
        self.depth -= 1;
        result
    }

    fn project_items(
        &mut self,
        selection: &SelectionSet,
        source: &dyn FieldSource,
        path: &mut FieldPath,
        out: &mut Map<String, Value>,
    ) -> Result<(), QueryError> {
        for item in &selection.items {
            match item {
                Selection::Field(field) => {
                    let key = field.response_key().to_string();
                    path.push((field.name.clone(), key.clone()));
                    let value = if self.is_forbidden(path) {
                        self.record_forbidden(path);
                        Value::Null
                    } else if field.name == "__typename" {
                        source
                            .type_name()
                            .map(|t| Value::String(t.to_string()))
                            .unwrap_or(Value::Null)
                    } else {
                        self.project_value(field, source.field(&field.name), path)?
                    };
                    path.pop();
                    merge_field(out, key, value);
                }
                Selection::InlineFragment(fragment) => {
                    if type_matches(fragment.type_condition.as_deref(), source.type_name()) {
                        self.project(&fragment.selection, source, path, out)?;
                    }
                }
                Selection::FragmentSpread(name) => {
                    let document = self.document;
                    let fragment = document.fragment(name)?;
                    if type_matches(Some(&fragment.type_condition), source.type_name()) {
                        self.project(&fragment.selection, source, path, out)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn project_value(
        &mut self,
        field: &Field,
        value: Option<&Value>,
        path: &mut FieldPath,
    ) -> Result<Value, QueryError> {
        let Some(value) = value else {
            return Ok(Value::Null);
        };
        if field.selection.is_empty() {
            return Ok(value.clone());
        }
        match value {
            Value::Object(map) => {
                let mut out = Map::new();
                self.project(&field.selection, map, path, &mut out)?;
                Ok(Value::Object(out))
            }
            Value::Array(items) => {
                let mut projected = Vec::with_capacity(items.len());
                for item in items {
                    projected.push(match item {
                        Value::Object(map) => {
                            let mut out = Map::new();
                            self.project(&field.selection, map, path, &mut out)?;
                            Value::Object(out)
                        }
                        other => other.clone(),
                    });
                }
                Ok(Value::Array(projected))
            }
            other => Ok(other.clone()),
        }
    }

    fn is_forbidden(&self, path: &FieldPath) -> bool {
        if self.forbidden.is_empty() {
            return false;
        }
        let dotted = path
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(".");
        self.forbidden.iter().any(|f| *f == dotted)
    }

    fn record_forbidden(&mut self, path: &FieldPath) {
        let keys: Vec<Value> = path.iter().map(|(_, key)| Value::String(key.clone())).collect();
        let error = json!({ "message": SYNC_FIELD_NOT_ALLOWED, "path": keys });
        if !self.errors.contains(&error) {
            self.errors.push(error);
        }
        if let Some((_, top)) = path.first() {
            if !self.nulled.contains(top) {
                self.nulled.push(top.clone());
            }
        }
    }
}

fn type_matches(condition: Option<&str>, type_name: Option<&str>) -> bool {
    match condition {
        None => true,
        Some(condition) => type_name == Some(condition),
    }
}

/// Same response key selected twice merges sub-selections.
fn merge_field(out: &mut Map<String, Value>, key: String, value: Value) {
    match (out.get_mut(&key), value) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => {
            for (k, v) in incoming {
                merge_field(existing, k, v);
            }
        }
        (Some(Value::Array(existing)), Value::Array(incoming)) if existing.len() == incoming.len() => {
            for (slot, item) in existing.iter_mut().zip(incoming) {
                if let (Value::Object(slot), Value::Object(item)) = (slot, item) {
                    for (k, v) in item {
                        merge_field(slot, k, v);
                    }
                }
            }
        }
        (Some(_), _) => {}
        (None, value) => {
            out.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_types::{CHECKOUT_FILTER_SHIPPING_METHODS, ORDER_CREATED, PRODUCT_UPDATED};
    use crate::types::{global_id, Entity};

    fn generator() -> PayloadGenerator {
        PayloadGenerator::new(Arc::new(EventRegistry::default_registry()), "3.20.0")
    }

    fn order() -> SubscribablePayload {
        SubscribablePayload::Single(
            Entity::new("Order", "42")
                .with_field("number", "1001")
                .with_field("total", 12.5)
                .with_entity("channel", &Entity::new("Channel", "1").with_field("slug", "default")),
        )
    }

    #[test]
    fn projects_inline_fragment_for_matching_event() {
        let query = "subscription { event { ... on OrderCreated { order { id number channel { slug } } } } }";
        let payload = generator()
            .generate(ORDER_CREATED, &order(), query, &mut GenerationCache::new(), None, None)
            .unwrap()
            .unwrap();

        assert_eq!(
            payload,
            json!({
                "order": {
                    "id": global_id("Order", "42"),
                    "number": "1001",
                    "channel": { "slug": "default" },
                }
            })
        );
    }

    #[test]
    fn non_matching_fragment_produces_no_payload() {
        let query = "subscription { event { ... on ProductUpdated { product { id } } } }";
        let payload = generator()
            .generate(ORDER_CREATED, &order(), query, &mut GenerationCache::new(), None, None)
            .unwrap();
        assert_eq!(payload, None);
    }

    #[test]
    fn event_named_root_field_and_aliases() {
        let query = "subscription { orderCreated { ref: order { orderId: id } kind: __typename } }";
        let payload = generator()
            .generate(ORDER_CREATED, &order(), query, &mut GenerationCache::new(), None, None)
            .unwrap()
            .unwrap();
        assert_eq!(
            payload,
            json!({ "ref": { "orderId": global_id("Order", "42") }, "kind": "OrderCreated" })
        );
    }

    #[test]
    fn output_is_byte_identical_for_same_state() {
        let query = "subscription { event { ... on OrderCreated { order { total number id } } } }";
        let generator = generator();
        let first = generator
            .generate(ORDER_CREATED, &order(), query, &mut GenerationCache::new(), None, None)
            .unwrap();
        let second = generator
            .generate(ORDER_CREATED, &order(), query, &mut GenerationCache::new(), None, None)
            .unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        assert!(serde_json::to_string(&first).unwrap().starts_with(r#"{"order":{"total""#));
    }

    #[test]
    fn context_is_built_once_per_object() {
        let generator = generator();
        let mut cache = GenerationCache::new();
        let a = "subscription { event { ... on OrderCreated { order { id } } } }";
        let b = "subscription { event { ... on OrderCreated { order { number } } } }";
        generator.generate(ORDER_CREATED, &order(), a, &mut cache, None, None).unwrap();
        generator.generate(ORDER_CREATED, &order(), b, &mut cache, None, None).unwrap();
        assert_eq!(cache.context_count(), 1);
    }

    #[test]
    fn forbidden_field_in_sync_event_nulls_subject() {
        let checkout = Entity::new("Checkout", "c-1").with_field("email", "a@example.com");
        let subscribable = SubscribablePayload::WithContext(checkout, json!([]));
        let query = r#"
            subscription {
              event {
                ... on CheckoutFilterShippingMethods {
                  checkout { id shippingMethods { id } }
                }
              }
            }
        "#;
        let payload = generator()
            .generate(
                CHECKOUT_FILTER_SHIPPING_METHODS,
                &subscribable,
                query,
                &mut GenerationCache::new(),
                None,
                None,
            )
            .unwrap()
            .unwrap();

        assert_eq!(payload["checkout"], Value::Null);
        assert_eq!(payload["errors"][0]["message"], json!(SYNC_FIELD_NOT_ALLOWED));
    }

    #[test]
    fn named_fragments_and_recipient() {
        let app = App::new("7", "Warehouse");
        let product = SubscribablePayload::Single(Entity::new("Product", "p-1").with_field("name", "Mug"));
        let query = r#"
            subscription { event { ...Payload } }
            fragment Payload on ProductUpdated { product { name } recipient { name } }
        "#;
        let payload = generator()
            .generate(PRODUCT_UPDATED, &product, query, &mut GenerationCache::new(), None, Some(&app))
            .unwrap()
            .unwrap();
        assert_eq!(payload, json!({ "product": { "name": "Mug" }, "recipient": { "name": "Warehouse" } }));
    }

    #[test]
    fn deleted_subject_produces_no_payload() {
        let deleted = SubscribablePayload::Deleted(crate::types::ModelRef::new("Order", "42"));
        let query = "subscription { event { ... on OrderCreated { order { id } } } }";
        let payload = generator()
            .generate(ORDER_CREATED, &deleted, query, &mut GenerationCache::new(), None, None)
            .unwrap();
        assert_eq!(payload, None);
    }

    #[test]
    fn fragments_cannot_nest_past_the_limit_together() {
        let wrap = |inner: String| {
            format!("{}{inner}{}", "... on OrderCreated { ".repeat(50), "} ".repeat(50))
        };
        let mut query = String::from("subscription { event { ...F0 } }\n");
        for i in 0..3 {
            query.push_str(&format!("fragment F{i} on OrderCreated {{ {} }}\n", wrap(format!("...F{}", i + 1))));
        }
        query.push_str("fragment F3 on OrderCreated { __typename }");

        let err = generator()
            .generate(ORDER_CREATED, &order(), &query, &mut GenerationCache::new(), None, None)
            .unwrap_err();
        assert_eq!(err, QueryError::NestingTooDeep { max_depth: MAX_NESTING });
    }

    #[test]
    fn unknown_event_is_an_error() {
        let err = generator()
            .generate("nope", &order(), "subscription { event { __typename } }", &mut GenerationCache::new(), None, None)
            .unwrap_err();
        assert_eq!(err, QueryError::UnknownEvent("nope".into()));
    }
}
