use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::LedgerError;
use crate::types::{
    DeliveryId, DeliveryStatus, EventDelivery, EventDeliveryAttempt, EventPayload, PayloadId, WebhookId,
};

/// Persistent record of payloads, deliveries and attempts.
///
/// Deliveries only move from PENDING to a terminal status; attempts receive
/// exactly one outcome update.
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    async fn bulk_save_payloads(&self, payloads: &[EventPayload]) -> Result<(), LedgerError>;
    async fn payload(&self, id: &PayloadId) -> Result<Option<EventPayload>, LedgerError>;

    async fn bulk_create_deliveries(&self, deliveries: &[EventDelivery]) -> Result<(), LedgerError>;
    async fn delivery(&self, id: &DeliveryId) -> Result<Option<EventDelivery>, LedgerError>;
    async fn set_delivery_payload(&self, id: &DeliveryId, payload_id: &PayloadId) -> Result<(), LedgerError>;
    async fn set_delivery_status(&self, id: &DeliveryId, status: DeliveryStatus) -> Result<(), LedgerError>;

    /// Remove a delivery with its attempts. Returns the payload when no other
    /// delivery references it anymore (it is removed as well).
    async fn delete_delivery(&self, id: &DeliveryId) -> Result<Option<EventPayload>, LedgerError>;

    /// Oldest first, at most `limit`.
    async fn pending_deliveries(&self, webhook_ids: &[WebhookId], limit: usize) -> Result<Vec<EventDelivery>, LedgerError>;
    async fn list_deliveries(&self) -> Result<Vec<EventDelivery>, LedgerError>;
    async fn list_payloads(&self) -> Result<Vec<EventPayload>, LedgerError>;

    async fn create_attempt(&self, attempt: &EventDeliveryAttempt) -> Result<(), LedgerError>;
    async fn update_attempt(&self, attempt: &EventDeliveryAttempt) -> Result<(), LedgerError>;

    /// Most recent first.
    async fn attempts(&self, delivery_id: &DeliveryId) -> Result<Vec<EventDeliveryAttempt>, LedgerError>;
}

/// External storage for payloads too large to keep inline.
#[async_trait]
pub trait PayloadBlobStore: Send + Sync {
    async fn put(&self, key: &str, content: &str) -> Result<(), LedgerError>;
    async fn get(&self, key: &str) -> Result<Option<String>, LedgerError>;
    async fn delete(&self, key: &str) -> Result<(), LedgerError>;
}

fn check_transition(from: DeliveryStatus, to: DeliveryStatus) -> Result<(), LedgerError> {
    if from == to || from == DeliveryStatus::Pending {
        Ok(())
    } else {
        Err(LedgerError::InvalidTransition { from, to })
    }
}

pub(crate) fn validate_transition(from: DeliveryStatus, to: DeliveryStatus) -> Result<(), LedgerError> {
    check_transition(from, to)
}

#[derive(Default)]
struct LedgerState {
    payloads: HashMap<PayloadId, EventPayload>,
    deliveries: HashMap<DeliveryId, EventDelivery>,
    delivery_order: Vec<DeliveryId>,
    attempts: Vec<EventDeliveryAttempt>,
}

/// In-memory ledger for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    bulk_calls: Mutex<usize>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `bulk_create_deliveries` calls made so far.
    pub async fn bulk_insert_calls(&self) -> usize {
        *self.bulk_calls.lock().await
    }
}

#[async_trait]
impl DeliveryLedger for InMemoryLedger {
    async fn bulk_save_payloads(&self, payloads: &[EventPayload]) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        for payload in payloads {
            state.payloads.insert(payload.id, payload.clone());
        }
        Ok(())
    }

    async fn payload(&self, id: &PayloadId) -> Result<Option<EventPayload>, LedgerError> {
        Ok(self.state.lock().await.payloads.get(id).cloned())
    }

    async fn bulk_create_deliveries(&self, deliveries: &[EventDelivery]) -> Result<(), LedgerError> {
        *self.bulk_calls.lock().await += 1;
        let mut state = self.state.lock().await;
        for delivery in deliveries {
            if state.deliveries.insert(delivery.id, delivery.clone()).is_none() {
                state.delivery_order.push(delivery.id);
            }
        }
        Ok(())
    }

    async fn delivery(&self, id: &DeliveryId) -> Result<Option<EventDelivery>, LedgerError> {
        Ok(self.state.lock().await.deliveries.get(id).cloned())
    }

    async fn set_delivery_payload(&self, id: &DeliveryId, payload_id: &PayloadId) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let delivery = state.deliveries.get_mut(id).ok_or_else(|| LedgerError::NotFound {
            kind: "delivery",
            id: id.to_string(),
        })?;
        delivery.payload_id = Some(*payload_id);
        Ok(())
    }

    async fn set_delivery_status(&self, id: &DeliveryId, status: DeliveryStatus) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let delivery = state.deliveries.get_mut(id).ok_or_else(|| LedgerError::NotFound {
            kind: "delivery",
            id: id.to_string(),
        })?;
        check_transition(delivery.status, status)?;
        delivery.status = status;
        Ok(())
    }

    async fn delete_delivery(&self, id: &DeliveryId) -> Result<Option<EventPayload>, LedgerError> {
        let mut state = self.state.lock().await;
        let Some(delivery) = state.deliveries.remove(id) else {
            return Ok(None);
        };
        state.delivery_order.retain(|d| d != id);
        state.attempts.retain(|a| a.delivery_id != Some(*id));

        let Some(payload_id) = delivery.payload_id else {
            return Ok(None);
        };
        let shared = state
            .deliveries
            .values()
            .any(|d| d.payload_id == Some(payload_id));
        if shared {
            return Ok(None);
        }
        Ok(state.payloads.remove(&payload_id))
    }

    async fn pending_deliveries(&self, webhook_ids: &[WebhookId], limit: usize) -> Result<Vec<EventDelivery>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .delivery_order
            .iter()
            .filter_map(|id| state.deliveries.get(id))
            .filter(|d| d.status == DeliveryStatus::Pending && webhook_ids.contains(&d.webhook_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_deliveries(&self) -> Result<Vec<EventDelivery>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .delivery_order
            .iter()
            .filter_map(|id| state.deliveries.get(id))
            .cloned()
            .collect())
    }

    async fn list_payloads(&self) -> Result<Vec<EventPayload>, LedgerError> {
        Ok(self.state.lock().await.payloads.values().cloned().collect())
    }

    async fn create_attempt(&self, attempt: &EventDeliveryAttempt) -> Result<(), LedgerError> {
        self.state.lock().await.attempts.push(attempt.clone());
        Ok(())
    }

    async fn update_attempt(&self, attempt: &EventDeliveryAttempt) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let stored = state
            .attempts
            .iter_mut()
            .find(|a| a.id == attempt.id)
            .ok_or_else(|| LedgerError::NotFound {
                kind: "attempt",
                id: attempt.id.to_string(),
            })?;
        if stored.status != DeliveryStatus::Pending {
            return Err(LedgerError::AttemptAlreadyRecorded(attempt.id));
        }
        *stored = attempt.clone();
        Ok(())
    }

    async fn attempts(&self, delivery_id: &DeliveryId) -> Result<Vec<EventDeliveryAttempt>, LedgerError> {
        let state = self.state.lock().await;
        let mut attempts: Vec<EventDeliveryAttempt> = state
            .attempts
            .iter()
            .filter(|a| a.delivery_id == Some(*delivery_id))
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps; reverse it
        // afterwards so the newest attempt comes first.
        attempts.sort_by_key(|a| a.created_at);
        attempts.reverse();
        Ok(attempts)
    }
}

/// In-memory blob store.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, String>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.lock().await.is_empty()
    }
}

#[async_trait]
impl PayloadBlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, content: &str) -> Result<(), LedgerError> {
        self.blobs.lock().await.insert(key.to_string(), content.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LedgerError> {
        Ok(self.blobs.lock().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), LedgerError> {
        self.blobs.lock().await.remove(key);
        Ok(())
    }
}

/// Creates and resolves event payloads, inline or blob-backed.
#[derive(Clone)]
pub struct PayloadStore {
    ledger: Arc<dyn DeliveryLedger>,
    blobs: Arc<dyn PayloadBlobStore>,
    inline_limit: usize,
}

impl PayloadStore {
    pub fn new(ledger: Arc<dyn DeliveryLedger>, blobs: Arc<dyn PayloadBlobStore>, inline_limit: usize) -> Self {
        Self {
            ledger,
            blobs,
            inline_limit,
        }
    }

    /// Build a payload record, writing large content to the blob store.
    /// The record itself is not saved.
    pub async fn prepare(&self, text: String) -> Result<EventPayload, LedgerError> {
        if text.len() <= self.inline_limit {
            return Ok(EventPayload::inline(text));
        }
        let id = PayloadId::new();
        let key = format!("payloads/{id}.json");
        self.blobs.put(&key, &text).await?;
        Ok(EventPayload::blob(id, key))
    }

    /// Prepare and save a single payload.
    pub async fn create(&self, text: String) -> Result<EventPayload, LedgerError> {
        let payload = self.prepare(text).await?;
        self.ledger.bulk_save_payloads(std::slice::from_ref(&payload)).await?;
        Ok(payload)
    }

    pub async fn resolve(&self, payload: &EventPayload) -> Result<Option<String>, LedgerError> {
        if let Some(text) = &payload.payload {
            return Ok(Some(text.clone()));
        }
        match &payload.payload_file {
            Some(key) => self.blobs.get(key).await,
            None => Ok(None),
        }
    }

    pub async fn load(&self, id: &PayloadId) -> Result<Option<String>, LedgerError> {
        match self.ledger.payload(id).await? {
            Some(payload) => self.resolve(&payload).await,
            None => Ok(None),
        }
    }

    /// Drop blob content of a payload removed from the ledger.
    pub async fn discard(&self, payload: &EventPayload) -> Result<(), LedgerError> {
        match &payload.payload_file {
            Some(key) => self.blobs.delete(key).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(limit: usize) -> (Arc<InMemoryLedger>, Arc<InMemoryBlobStore>, PayloadStore) {
        let ledger = Arc::new(InMemoryLedger::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let store = PayloadStore::new(ledger.clone(), blobs.clone(), limit);
        (ledger, blobs, store)
    }

    #[tokio::test]
    async fn inline_and_blob_payloads_resolve_to_same_text() {
        let (_, blobs, store) = store(8);
        let small = store.create("{}".into()).await.unwrap();
        let large = store.create(r#"{"order":{"id":"1"}}"#.into()).await.unwrap();

        assert!(small.payload.is_some());
        assert!(large.payload.is_none());
        assert_eq!(blobs.len().await, 1);
        assert_eq!(store.load(&small.id).await.unwrap().as_deref(), Some("{}"));
        assert_eq!(
            store.load(&large.id).await.unwrap().as_deref(),
            Some(r#"{"order":{"id":"1"}}"#)
        );
    }

    #[tokio::test]
    async fn terminal_status_cannot_change() {
        let ledger = InMemoryLedger::new();
        let delivery = EventDelivery::new("order_created", WebhookId("w".into()), None);
        ledger.bulk_create_deliveries(&[delivery.clone()]).await.unwrap();

        ledger.set_delivery_status(&delivery.id, DeliveryStatus::Failed).await.unwrap();
        let err = ledger
            .set_delivery_status(&delivery.id, DeliveryStatus::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn attempt_outcome_is_recorded_once() {
        let ledger = InMemoryLedger::new();
        let mut attempt = EventDeliveryAttempt::pending(DeliveryId::new(), None);
        ledger.create_attempt(&attempt).await.unwrap();

        attempt.status = DeliveryStatus::Failed;
        ledger.update_attempt(&attempt).await.unwrap();
        assert!(matches!(
            ledger.update_attempt(&attempt).await,
            Err(LedgerError::AttemptAlreadyRecorded(_))
        ));
    }

    #[tokio::test]
    async fn deleting_delivery_keeps_shared_payload() {
        let (ledger, _, store) = store(1024);
        let payload = store.create("{}".into()).await.unwrap();
        let first = EventDelivery::new("order_created", WebhookId("a".into()), Some(payload.id));
        let second = EventDelivery::new("order_created", WebhookId("b".into()), Some(payload.id));
        ledger.bulk_create_deliveries(&[first.clone(), second.clone()]).await.unwrap();
        ledger
            .create_attempt(&EventDeliveryAttempt::pending(first.id, None))
            .await
            .unwrap();

        assert_eq!(ledger.delete_delivery(&first.id).await.unwrap(), None);
        assert!(ledger.attempts(&first.id).await.unwrap().is_empty());
        assert_eq!(ledger.delete_delivery(&second.id).await.unwrap().map(|p| p.id), Some(payload.id));
        assert!(ledger.list_payloads().await.unwrap().is_empty());
    }
}
