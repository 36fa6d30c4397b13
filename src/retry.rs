use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::observability::{metric_inc, AttemptReport, ObservabilitySink};
use crate::storage::{DeliveryLedger, PayloadStore};
use crate::types::{DeliveryStatus, EventDelivery, EventDeliveryAttempt, WebhookResponse};

/// Backoff and attempt cap for one delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base: Duration,

    /// Attempts per delivery, the first one included.
    pub max_attempts: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            max_attempts: 5,
            max_delay: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, used by tasks that must not repeat.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the retry that follows attempt number `attempt` (1-based).
    pub fn countdown(&self, attempt: u32) -> Duration {
        let pow = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(pow).min(self.max_delay.max(self.base))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

/// Records attempts and decides what happens after each one.
#[derive(Clone)]
pub struct AttemptController {
    ledger: Arc<dyn DeliveryLedger>,
    payloads: PayloadStore,
    observability: Arc<dyn ObservabilitySink>,
    policy: RetryPolicy,
    clear_successful: bool,
}

impl AttemptController {
    pub fn new(
        ledger: Arc<dyn DeliveryLedger>,
        payloads: PayloadStore,
        observability: Arc<dyn ObservabilitySink>,
        policy: RetryPolicy,
        clear_successful: bool,
    ) -> Self {
        Self {
            ledger,
            payloads,
            observability,
            policy,
            clear_successful,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Persist a PENDING attempt right before the transport call.
    pub async fn begin(
        &self,
        delivery: &EventDelivery,
        task_id: Option<String>,
    ) -> Result<EventDeliveryAttempt, LedgerError> {
        let attempt = EventDeliveryAttempt::pending(delivery.id, task_id);
        self.ledger.create_attempt(&attempt).await?;
        Ok(attempt)
    }

    /// Stamp the transport outcome on the attempt. Called once per attempt.
    pub async fn finish(
        &self,
        delivery: &EventDelivery,
        mut attempt: EventDeliveryAttempt,
        response: &WebhookResponse,
    ) -> Result<EventDeliveryAttempt, LedgerError> {
        attempt.status = response.status;
        attempt.duration = Some(response.duration.as_secs_f64());
        attempt.response = Some(response.content.clone());
        attempt.response_status_code = response.status_code;
        attempt.request_headers = serde_json::to_string(&response.request_headers).ok();
        attempt.response_headers = serde_json::to_string(&response.response_headers).ok();
        self.ledger.update_attempt(&attempt).await?;

        self.observability
            .report(AttemptReport {
                attempt_id: attempt.id,
                delivery_id: attempt.delivery_id,
                webhook_id: delivery.webhook_id.clone(),
                event_type: delivery.event_type.clone(),
                status: attempt.status,
                status_code: attempt.response_status_code,
                duration: response.duration,
                created_at: attempt.created_at,
            })
            .await;
        Ok(attempt)
    }

    /// Mark the delivery delivered, pruning it when configured.
    pub async fn handle_success(&self, delivery: &EventDelivery) -> Result<(), LedgerError> {
        self.ledger
            .set_delivery_status(&delivery.id, DeliveryStatus::Success)
            .await?;
        metric_inc("webhook.delivery.success");

        if self.clear_successful {
            if let Some(orphan) = self.ledger.delete_delivery(&delivery.id).await? {
                self.payloads.discard(&orphan).await?;
            }
        }
        Ok(())
    }

    /// Time left before the next attempt of `delivery` is due, measured from
    /// its latest recorded attempt. `None` when it may be sent now.
    pub async fn retry_wait(&self, delivery: &EventDelivery) -> Result<Option<Duration>, LedgerError> {
        let attempts = self.ledger.attempts(&delivery.id).await?;
        let Some(latest) = attempts.first() else {
            return Ok(None);
        };
        let countdown = self.policy.countdown(attempts.len() as u32);
        let elapsed = (chrono::Utc::now() - latest.created_at).to_std().unwrap_or_default();
        Ok(countdown.checked_sub(elapsed).filter(|wait| !wait.is_zero()))
    }

    /// Decide whether a failed attempt is retried.
    ///
    /// The delivery is marked FAILED when the response is terminal or the
    /// attempt budget is spent.
    pub async fn handle_failure(
        &self,
        delivery: &EventDelivery,
        response: &WebhookResponse,
    ) -> Result<RetryDecision, LedgerError> {
        let attempts = self.ledger.attempts(&delivery.id).await?.len() as u32;

        if response.is_retryable() && attempts < self.policy.max_attempts {
            let countdown = self.policy.countdown(attempts);
            tracing::info!(
                delivery_id = %delivery.id,
                webhook_id = %delivery.webhook_id,
                attempts,
                countdown_secs = countdown.as_secs_f64(),
                "webhook delivery failed, retrying"
            );
            metric_inc("webhook.delivery.retry_scheduled");
            return Ok(RetryDecision::Retry(countdown));
        }

        tracing::warn!(
            delivery_id = %delivery.id,
            webhook_id = %delivery.webhook_id,
            attempts,
            "webhook delivery failed permanently"
        );
        self.ledger
            .set_delivery_status(&delivery.id, DeliveryStatus::Failed)
            .await?;
        metric_inc("webhook.delivery.failed");
        Ok(RetryDecision::GiveUp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use crate::observability::NoopObservability;
    use crate::storage::{InMemoryBlobStore, InMemoryLedger};
    use crate::types::WebhookId;

    #[test]
    fn countdown_doubles_and_caps() {
        let policy = RetryPolicy {
            base: Duration::from_secs(10),
            max_attempts: 5,
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(policy.countdown(1), Duration::from_secs(10));
        assert_eq!(policy.countdown(2), Duration::from_secs(20));
        assert_eq!(policy.countdown(3), Duration::from_secs(40));
        assert_eq!(policy.countdown(4), Duration::from_secs(60));
        assert_eq!(policy.countdown(40), Duration::from_secs(60));
    }

    fn controller(ledger: Arc<InMemoryLedger>, clear: bool) -> AttemptController {
        let payloads = PayloadStore::new(ledger.clone(), Arc::new(InMemoryBlobStore::new()), 1024);
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        AttemptController::new(ledger, payloads, Arc::new(NoopObservability), policy, clear)
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let ledger = Arc::new(InMemoryLedger::new());
        let controller = controller(ledger.clone(), true);
        let delivery = EventDelivery::new("order_created", WebhookId("w".into()), None);
        ledger.bulk_create_deliveries(&[delivery.clone()]).await.unwrap();
        let failed = WebhookResponse::failed(FailureReason::RemoteError, "boom");

        let attempt = controller.begin(&delivery, None).await.unwrap();
        controller.finish(&delivery, attempt, &failed).await.unwrap();
        assert!(matches!(
            controller.handle_failure(&delivery, &failed).await.unwrap(),
            RetryDecision::Retry(_)
        ));

        let attempt = controller.begin(&delivery, None).await.unwrap();
        controller.finish(&delivery, attempt, &failed).await.unwrap();
        assert_eq!(
            controller.handle_failure(&delivery, &failed).await.unwrap(),
            RetryDecision::GiveUp
        );
        let stored = ledger.delivery(&delivery.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn client_errors_are_terminal() {
        let ledger = Arc::new(InMemoryLedger::new());
        let controller = controller(ledger.clone(), true);
        let delivery = EventDelivery::new("order_created", WebhookId("w".into()), None);
        ledger.bulk_create_deliveries(&[delivery.clone()]).await.unwrap();

        let rejected = WebhookResponse::failed(FailureReason::ClientError, "bad request");
        assert_eq!(
            controller.handle_failure(&delivery, &rejected).await.unwrap(),
            RetryDecision::GiveUp
        );
    }

    #[tokio::test]
    async fn failed_delivery_waits_for_its_countdown() {
        let ledger = Arc::new(InMemoryLedger::new());
        let controller = controller(ledger.clone(), false);
        let delivery = EventDelivery::new("order_created", WebhookId("w".into()), None);
        ledger.bulk_create_deliveries(&[delivery.clone()]).await.unwrap();
        assert_eq!(controller.retry_wait(&delivery).await.unwrap(), None);

        let failed = WebhookResponse::failed(FailureReason::RemoteError, "boom");
        let attempt = controller.begin(&delivery, None).await.unwrap();
        controller.finish(&delivery, attempt, &failed).await.unwrap();

        let wait = controller.retry_wait(&delivery).await.unwrap().unwrap();
        assert!(wait <= Duration::from_secs(10));
        assert!(wait > Duration::from_secs(9));
    }

    #[tokio::test]
    async fn success_clears_delivery() {
        let ledger = Arc::new(InMemoryLedger::new());
        let controller = controller(ledger.clone(), true);
        let delivery = EventDelivery::new("order_created", WebhookId("w".into()), None);
        ledger.bulk_create_deliveries(&[delivery.clone()]).await.unwrap();

        controller.handle_success(&delivery).await.unwrap();
        assert_eq!(ledger.delivery(&delivery.id).await.unwrap(), None);
    }
}
