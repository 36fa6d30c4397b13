#[cfg(feature = "postgres")]
use async_trait::async_trait;
#[cfg(feature = "postgres")]
use tokio_postgres::types::ToSql;
#[cfg(feature = "postgres")]
use tokio_postgres::{Client, Row};
#[cfg(feature = "postgres")]
use uuid::Uuid;

#[cfg(feature = "postgres")]
use crate::error::LedgerError;
#[cfg(feature = "postgres")]
use crate::storage::{validate_transition, DeliveryLedger};
#[cfg(feature = "postgres")]
use crate::types::{
    AttemptId, DeliveryId, DeliveryStatus, EventDelivery, EventDeliveryAttempt, EventPayload, PayloadId, WebhookId,
};

/// Ledger backed by the `event_payload`, `event_delivery` and
/// `event_delivery_attempt` tables.
#[cfg(feature = "postgres")]
pub struct PostgresLedger {
    client: Client,
}

#[cfg(feature = "postgres")]
fn backend(err: tokio_postgres::Error) -> LedgerError {
    LedgerError::Backend(err.to_string())
}

#[cfg(feature = "postgres")]
impl PostgresLedger {
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS event_payload (
                    id UUID PRIMARY KEY,
                    payload TEXT,
                    payload_file TEXT,
                    created_at TIMESTAMPTZ NOT NULL
                );
                CREATE TABLE IF NOT EXISTS event_delivery (
                    id UUID PRIMARY KEY,
                    created_at TIMESTAMPTZ NOT NULL,
                    status TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    payload_id UUID REFERENCES event_payload (id) ON DELETE SET NULL,
                    webhook_id TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS event_delivery_attempt (
                    id UUID PRIMARY KEY,
                    delivery_id UUID REFERENCES event_delivery (id) ON DELETE CASCADE,
                    created_at TIMESTAMPTZ NOT NULL,
                    task_id TEXT,
                    duration DOUBLE PRECISION,
                    response TEXT,
                    response_headers TEXT,
                    response_status_code INTEGER,
                    request_headers TEXT,
                    status TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS event_delivery_pending_idx
                    ON event_delivery (webhook_id, created_at) WHERE status = 'pending';",
            )
            .await?;

        Ok(Self { client })
    }

    fn payload_from_row(row: &Row) -> Result<EventPayload, LedgerError> {
        Ok(EventPayload {
            id: PayloadId(row.try_get("id").map_err(backend)?),
            payload: row.try_get("payload").map_err(backend)?,
            payload_file: row.try_get("payload_file").map_err(backend)?,
            created_at: row.try_get("created_at").map_err(backend)?,
        })
    }

    fn delivery_from_row(row: &Row) -> Result<EventDelivery, LedgerError> {
        let status: String = row.try_get("status").map_err(backend)?;
        let payload_id: Option<Uuid> = row.try_get("payload_id").map_err(backend)?;
        Ok(EventDelivery {
            id: DeliveryId(row.try_get("id").map_err(backend)?),
            created_at: row.try_get("created_at").map_err(backend)?,
            status: parse_status(&status)?,
            event_type: row.try_get("event_type").map_err(backend)?,
            payload_id: payload_id.map(PayloadId),
            webhook_id: WebhookId(row.try_get("webhook_id").map_err(backend)?),
        })
    }

    fn attempt_from_row(row: &Row) -> Result<EventDeliveryAttempt, LedgerError> {
        let status: String = row.try_get("status").map_err(backend)?;
        let delivery_id: Option<Uuid> = row.try_get("delivery_id").map_err(backend)?;
        let status_code: Option<i32> = row.try_get("response_status_code").map_err(backend)?;
        Ok(EventDeliveryAttempt {
            id: AttemptId(row.try_get("id").map_err(backend)?),
            delivery_id: delivery_id.map(DeliveryId),
            created_at: row.try_get("created_at").map_err(backend)?,
            task_id: row.try_get("task_id").map_err(backend)?,
            duration: row.try_get("duration").map_err(backend)?,
            response: row.try_get("response").map_err(backend)?,
            response_headers: row.try_get("response_headers").map_err(backend)?,
            response_status_code: status_code.and_then(|c| u16::try_from(c).ok()),
            request_headers: row.try_get("request_headers").map_err(backend)?,
            status: parse_status(&status)?,
        })
    }
}

#[cfg(feature = "postgres")]
fn parse_status(value: &str) -> Result<DeliveryStatus, LedgerError> {
    DeliveryStatus::parse(value).ok_or_else(|| LedgerError::Backend(format!("unknown delivery status `{value}`")))
}

/// `($1, $2, ...), ($n+1, ...)` for a multi-row insert.
#[cfg(feature = "postgres")]
fn values_clause(rows: usize, columns: usize) -> String {
    (0..rows)
        .map(|row| {
            let params: Vec<String> = (1..=columns).map(|col| format!("${}", row * columns + col)).collect();
            format!("({})", params.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(feature = "postgres")]
#[async_trait]
impl DeliveryLedger for PostgresLedger {
    async fn bulk_save_payloads(&self, payloads: &[EventPayload]) -> Result<(), LedgerError> {
        if payloads.is_empty() {
            return Ok(());
        }
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(payloads.len() * 4);
        for payload in payloads {
            params.push(&payload.id.0);
            params.push(&payload.payload);
            params.push(&payload.payload_file);
            params.push(&payload.created_at);
        }
        let sql = format!(
            "INSERT INTO event_payload (id, payload, payload_file, created_at) VALUES {} ON CONFLICT (id) DO NOTHING",
            values_clause(payloads.len(), 4)
        );
        self.client.execute(sql.as_str(), &params).await.map_err(backend)?;
        Ok(())
    }

    async fn payload(&self, id: &PayloadId) -> Result<Option<EventPayload>, LedgerError> {
        let row = self
            .client
            .query_opt("SELECT * FROM event_payload WHERE id = $1", &[&id.0])
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::payload_from_row).transpose()
    }

    async fn bulk_create_deliveries(&self, deliveries: &[EventDelivery]) -> Result<(), LedgerError> {
        if deliveries.is_empty() {
            return Ok(());
        }
        let payload_ids: Vec<Option<Uuid>> = deliveries.iter().map(|d| d.payload_id.map(|p| p.0)).collect();
        let statuses: Vec<&'static str> = deliveries.iter().map(|d| d.status.as_str()).collect();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(deliveries.len() * 6);
        for (index, delivery) in deliveries.iter().enumerate() {
            params.push(&delivery.id.0);
            params.push(&delivery.created_at);
            params.push(&statuses[index]);
            params.push(&delivery.event_type);
            params.push(&payload_ids[index]);
            params.push(&delivery.webhook_id.0);
        }
        let sql = format!(
            "INSERT INTO event_delivery (id, created_at, status, event_type, payload_id, webhook_id) VALUES {}",
            values_clause(deliveries.len(), 6)
        );
        self.client.execute(sql.as_str(), &params).await.map_err(backend)?;
        Ok(())
    }

    async fn delivery(&self, id: &DeliveryId) -> Result<Option<EventDelivery>, LedgerError> {
        let row = self
            .client
            .query_opt("SELECT * FROM event_delivery WHERE id = $1", &[&id.0])
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::delivery_from_row).transpose()
    }

    async fn set_delivery_payload(&self, id: &DeliveryId, payload_id: &PayloadId) -> Result<(), LedgerError> {
        let updated = self
            .client
            .execute("UPDATE event_delivery SET payload_id = $2 WHERE id = $1", &[&id.0, &payload_id.0])
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(LedgerError::NotFound {
                kind: "delivery",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_delivery_status(&self, id: &DeliveryId, status: DeliveryStatus) -> Result<(), LedgerError> {
        let current = self.delivery(id).await?.ok_or_else(|| LedgerError::NotFound {
            kind: "delivery",
            id: id.to_string(),
        })?;
        validate_transition(current.status, status)?;
        self.client
            .execute(
                "UPDATE event_delivery SET status = $2 WHERE id = $1 AND status IN ('pending', $2)",
                &[&id.0, &status.as_str()],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn delete_delivery(&self, id: &DeliveryId) -> Result<Option<EventPayload>, LedgerError> {
        let row = self
            .client
            .query_opt("DELETE FROM event_delivery WHERE id = $1 RETURNING payload_id", &[&id.0])
            .await
            .map_err(backend)?;
        let payload_id: Option<Uuid> = match row {
            Some(row) => row.try_get(0).map_err(backend)?,
            None => return Ok(None),
        };
        let Some(payload_id) = payload_id else {
            return Ok(None);
        };
        let row = self
            .client
            .query_opt(
                "DELETE FROM event_payload p WHERE p.id = $1
                 AND NOT EXISTS (SELECT 1 FROM event_delivery d WHERE d.payload_id = p.id)
                 RETURNING *",
                &[&payload_id],
            )
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::payload_from_row).transpose()
    }

    async fn pending_deliveries(&self, webhook_ids: &[WebhookId], limit: usize) -> Result<Vec<EventDelivery>, LedgerError> {
        let ids: Vec<&str> = webhook_ids.iter().map(|w| w.0.as_str()).collect();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .client
            .query(
                "SELECT * FROM event_delivery
                 WHERE status = 'pending' AND webhook_id = ANY($1)
                 ORDER BY created_at LIMIT $2",
                &[&ids, &limit],
            )
            .await
            .map_err(backend)?;
        rows.iter().map(Self::delivery_from_row).collect()
    }

    async fn list_deliveries(&self) -> Result<Vec<EventDelivery>, LedgerError> {
        let rows = self
            .client
            .query("SELECT * FROM event_delivery ORDER BY created_at", &[])
            .await
            .map_err(backend)?;
        rows.iter().map(Self::delivery_from_row).collect()
    }

    async fn list_payloads(&self) -> Result<Vec<EventPayload>, LedgerError> {
        let rows = self
            .client
            .query("SELECT * FROM event_payload ORDER BY created_at", &[])
            .await
            .map_err(backend)?;
        rows.iter().map(Self::payload_from_row).collect()
    }

    async fn create_attempt(&self, attempt: &EventDeliveryAttempt) -> Result<(), LedgerError> {
        let delivery_id = attempt.delivery_id.map(|d| d.0);
        let status_code = attempt.response_status_code.map(i32::from);
        self.client
            .execute(
                "INSERT INTO event_delivery_attempt
                 (id, delivery_id, created_at, task_id, duration, response, response_headers,
                  response_status_code, request_headers, status)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                &[
                    &attempt.id.0,
                    &delivery_id,
                    &attempt.created_at,
                    &attempt.task_id,
                    &attempt.duration,
                    &attempt.response,
                    &attempt.response_headers,
                    &status_code,
                    &attempt.request_headers,
                    &attempt.status.as_str(),
                ],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn update_attempt(&self, attempt: &EventDeliveryAttempt) -> Result<(), LedgerError> {
        let status_code = attempt.response_status_code.map(i32::from);
        let updated = self
            .client
            .execute(
                "UPDATE event_delivery_attempt
                 SET duration = $2, response = $3, response_headers = $4,
                     response_status_code = $5, request_headers = $6, status = $7
                 WHERE id = $1 AND status = 'pending'",
                &[
                    &attempt.id.0,
                    &attempt.duration,
                    &attempt.response,
                    &attempt.response_headers,
                    &status_code,
                    &attempt.request_headers,
                    &attempt.status.as_str(),
                ],
            )
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(LedgerError::AttemptAlreadyRecorded(attempt.id));
        }
        Ok(())
    }

    async fn attempts(&self, delivery_id: &DeliveryId) -> Result<Vec<EventDeliveryAttempt>, LedgerError> {
        let rows = self
            .client
            .query(
                "SELECT * FROM event_delivery_attempt WHERE delivery_id = $1 ORDER BY created_at DESC",
                &[&delivery_id.0],
            )
            .await
            .map_err(backend)?;
        rows.iter().map(Self::attempt_from_row).collect()
    }
}

#[cfg(all(test, feature = "postgres"))]
mod tests {
    use super::values_clause;

    #[test]
    fn numbers_parameters_row_by_row() {
        assert_eq!(values_clause(2, 3), "($1, $2, $3), ($4, $5, $6)");
    }
}
