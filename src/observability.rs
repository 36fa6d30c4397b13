//! Out-of-band reporting of delivery attempts.
//!
//! Reports never touch the ledger. A sink may drop them (sampling) or hold
//! them until a batch is full.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::types::{AttemptId, DeliveryId, DeliveryStatus, WebhookId};

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_event(name: &'static str, event_type: &str) {
    metrics::increment_counter!(name, "event_type" => event_type.to_string());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_event(_name: &'static str, _event_type: &str) {}

/// Summary of one finished attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptReport {
    pub attempt_id: AttemptId,
    pub delivery_id: Option<DeliveryId>,
    pub webhook_id: WebhookId,
    pub event_type: String,
    pub status: DeliveryStatus,
    pub status_code: Option<u16>,
    pub duration: Duration,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ObservabilitySink: Send + Sync {
    async fn report(&self, report: AttemptReport);
}

/// Discards every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObservability;

#[async_trait]
impl ObservabilitySink for NoopObservability {
    async fn report(&self, _report: AttemptReport) {}
}

/// Receives full batches from [`BufferedObservability`].
#[async_trait]
pub trait ObservabilityExporter: Send + Sync {
    async fn export(&self, batch: Vec<AttemptReport>);
}

/// Samples reports and hands them to an exporter in batches.
pub struct BufferedObservability {
    exporter: Arc<dyn ObservabilityExporter>,
    sample_rate: f64,
    batch_size: usize,
    buffer: Mutex<Vec<AttemptReport>>,
}

impl BufferedObservability {
    pub fn new(exporter: Arc<dyn ObservabilityExporter>, sample_rate: f64, batch_size: usize) -> Self {
        Self {
            exporter,
            sample_rate: sample_rate.clamp(0.0, 1.0),
            batch_size: batch_size.max(1),
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Export whatever is buffered, even a partial batch.
    pub async fn flush(&self) {
        let batch = std::mem::take(&mut *self.buffer.lock().await);
        if !batch.is_empty() {
            self.exporter.export(batch).await;
        }
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    fn sampled(&self) -> bool {
        if self.sample_rate >= 1.0 {
            return true;
        }
        fastrand::f64() < self.sample_rate
    }
}

#[async_trait]
impl ObservabilitySink for BufferedObservability {
    async fn report(&self, report: AttemptReport) {
        if !self.sampled() {
            metric_inc("webhook.observability.dropped");
            return;
        }
        let batch = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(report);
            if buffer.len() < self.batch_size {
                return;
            }
            std::mem::take(&mut *buffer)
        };
        tracing::debug!(size = batch.len(), "exporting attempt reports");
        self.exporter.export(batch).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Vec<AttemptReport>>>);

    #[async_trait]
    impl ObservabilityExporter for Collect {
        async fn export(&self, batch: Vec<AttemptReport>) {
            self.0.lock().await.push(batch);
        }
    }

    fn report() -> AttemptReport {
        AttemptReport {
            attempt_id: AttemptId::new(),
            delivery_id: Some(DeliveryId::new()),
            webhook_id: WebhookId("w".into()),
            event_type: "order_created".into(),
            status: DeliveryStatus::Success,
            status_code: Some(200),
            duration: Duration::from_millis(5),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn batches_until_full() {
        let exporter = Arc::new(Collect::default());
        let sink = BufferedObservability::new(exporter.clone(), 1.0, 2);

        sink.report(report()).await;
        assert!(exporter.0.lock().await.is_empty());
        sink.report(report()).await;
        sink.report(report()).await;
        assert_eq!(exporter.0.lock().await.len(), 1);
        assert_eq!(sink.buffered().await, 1);

        sink.flush().await;
        let batches = exporter.0.lock().await;
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[tokio::test]
    async fn zero_sample_rate_drops_everything() {
        let exporter = Arc::new(Collect::default());
        let sink = BufferedObservability::new(exporter.clone(), 0.0, 1);
        sink.report(report()).await;
        sink.flush().await;
        assert!(exporter.0.lock().await.is_empty());
    }
}
