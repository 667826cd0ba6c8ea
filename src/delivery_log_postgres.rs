#[cfg(feature = "postgres")]
use async_trait::async_trait;
#[cfg(feature = "postgres")]
use tokio_postgres::Client;

#[cfg(feature = "postgres")]
use crate::delivery_log::{DeliveryAttemptLog, DeliveryLogSink};
#[cfg(feature = "postgres")]
use crate::error::LogError;

/// Attempt-log sink backed by a `postback_delivery_logs` table.
#[cfg(feature = "postgres")]
pub struct PostgresDeliveryLog {
    client: Client,
}

#[cfg(feature = "postgres")]
impl PostgresDeliveryLog {
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS postback_delivery_logs (
                    id BIGSERIAL PRIMARY KEY,
                    job_id TEXT NOT NULL,
                    conversion_id TEXT NOT NULL,
                    attempt INTEGER NOT NULL,
                    request_method TEXT NOT NULL,
                    request_url TEXT NOT NULL,
                    request_body TEXT,
                    request_headers JSONB NOT NULL,
                    response_code INTEGER,
                    response_body TEXT,
                    error TEXT,
                    error_kind TEXT,
                    duration_ms BIGINT NOT NULL,
                    created_at_ms BIGINT NOT NULL
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE INDEX IF NOT EXISTS postback_delivery_logs_job
                 ON postback_delivery_logs (job_id, attempt)",
                &[],
            )
            .await?;

        Ok(Self { client })
    }

    /// Attempts for one job, oldest first.
    pub async fn for_job(&self, job_id: &str) -> Result<Vec<DeliveryAttemptLog>, tokio_postgres::Error> {
        let rows = self
            .client
            .query(
                "SELECT job_id, conversion_id, attempt, request_method, request_url,
                        request_body, request_headers, response_code, response_body,
                        error, error_kind, duration_ms, created_at_ms
                 FROM postback_delivery_logs
                 WHERE job_id = $1
                 ORDER BY id",
                &[&job_id],
            )
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let headers: serde_json::Value = row.try_get(6).ok()?;
                let attempt: i32 = row.try_get(2).ok()?;
                let response_code: Option<i32> = row.try_get(7).ok()?;
                let duration_ms: i64 = row.try_get(11).ok()?;
                let created_at_ms: i64 = row.try_get(12).ok()?;
                Some(DeliveryAttemptLog {
                    job_id: row.try_get(0).ok()?,
                    conversion_id: row.try_get(1).ok()?,
                    attempt: u32::try_from(attempt).ok()?,
                    request_method: row.try_get(3).ok()?,
                    request_url: row.try_get(4).ok()?,
                    request_body: row.try_get(5).ok()?,
                    request_headers: serde_json::from_value(headers).ok()?,
                    response_code: response_code.and_then(|c| u16::try_from(c).ok()),
                    response_body: row.try_get(8).ok()?,
                    error: row.try_get(9).ok()?,
                    error_kind: row.try_get(10).ok()?,
                    duration_ms: u64::try_from(duration_ms).unwrap_or_default(),
                    created_at_ms: u64::try_from(created_at_ms).unwrap_or_default(),
                })
            })
            .collect())
    }
}

#[cfg(feature = "postgres")]
#[async_trait]
impl DeliveryLogSink for PostgresDeliveryLog {
    async fn append(&self, entry: &DeliveryAttemptLog) -> Result<(), LogError> {
        let headers = serde_json::to_value(&entry.request_headers)
            .map_err(|e| LogError::Sink(e.to_string()))?;
        let attempt = i32::try_from(entry.attempt).unwrap_or(i32::MAX);
        let response_code = entry.response_code.map(i32::from);
        let duration_ms = i64::try_from(entry.duration_ms).unwrap_or(i64::MAX);
        let created_at_ms = i64::try_from(entry.created_at_ms).unwrap_or(i64::MAX);

        self.client
            .execute(
                "INSERT INTO postback_delivery_logs (
                    job_id, conversion_id, attempt, request_method, request_url,
                    request_body, request_headers, response_code, response_body,
                    error, error_kind, duration_ms, created_at_ms
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
                &[
                    &entry.job_id,
                    &entry.conversion_id,
                    &attempt,
                    &entry.request_method,
                    &entry.request_url,
                    &entry.request_body,
                    &headers,
                    &response_code,
                    &entry.response_body,
                    &entry.error,
                    &entry.error_kind,
                    &duration_ms,
                    &created_at_ms,
                ],
            )
            .await
            .map(|_| ())
            .map_err(|e| LogError::Sink(e.to_string()))
    }
}
