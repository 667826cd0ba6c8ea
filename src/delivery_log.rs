use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::LogError;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// One delivery attempt, as sent and as answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttemptLog {
    pub job_id: String,
    pub conversion_id: String,
    pub attempt: u32,
    pub request_method: String,
    pub request_url: String,
    pub request_body: Option<String>,
    pub request_headers: Vec<(String, String)>,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    /// Failure label from `FailureReason::kind`, for breakdowns.
    pub error_kind: Option<String>,
    pub duration_ms: u64,
    pub created_at_ms: u64,
}

/// Append-only destination for attempt records.
#[async_trait]
pub trait DeliveryLogSink: Send + Sync {
    async fn append(&self, entry: &DeliveryAttemptLog) -> Result<(), LogError>;
}

/// In-memory sink for lightweight deployments and tests.
#[derive(Default)]
pub struct InMemoryDeliveryLog {
    entries: Mutex<Vec<DeliveryAttemptLog>>,
}

impl InMemoryDeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries in append order.
    pub async fn entries(&self) -> Vec<DeliveryAttemptLog> {
        self.entries.lock().await.clone()
    }

    pub async fn for_job(&self, job_id: &str) -> Vec<DeliveryAttemptLog> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    pub async fn for_conversion(&self, conversion_id: &str) -> Vec<DeliveryAttemptLog> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.conversion_id == conversion_id)
            .cloned()
            .collect()
    }

    /// Failed attempts grouped by error kind.
    pub async fn failure_breakdown(&self) -> HashMap<String, u64> {
        let mut breakdown = HashMap::new();
        for entry in self.entries.lock().await.iter() {
            if let Some(kind) = &entry.error_kind {
                *breakdown.entry(kind.clone()).or_insert(0) += 1;
            }
        }
        breakdown
    }
}

#[async_trait]
impl DeliveryLogSink for InMemoryDeliveryLog {
    async fn append(&self, entry: &DeliveryAttemptLog) -> Result<(), LogError> {
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }
}

enum LogCommand {
    Append(Box<DeliveryAttemptLog>),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking front for a [`DeliveryLogSink`].
///
/// Records go through a bounded channel to a background writer. When the
/// channel is full or the sink fails, the record is reported through
/// `tracing` and counted as dropped; the delivery path never waits.
#[derive(Clone)]
pub struct DeliveryLogger {
    tx: mpsc::Sender<LogCommand>,
    truncate_len: usize,
    dropped: Arc<AtomicU64>,
}

impl DeliveryLogger {
    /// Spawn the background writer. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn DeliveryLogSink>, capacity: usize, truncate_len: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<LogCommand>(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let writer_dropped = dropped.clone();

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    LogCommand::Append(entry) => {
                        if let Err(err) = sink.append(&entry).await {
                            writer_dropped.fetch_add(1, Ordering::Relaxed);
                            metric_inc("postback.log.dropped");
                            tracing::warn!(
                                job_id = %entry.job_id,
                                attempt = entry.attempt,
                                error = %err,
                                "delivery attempt log write failed"
                            );
                        }
                    }
                    LogCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self {
            tx,
            truncate_len,
            dropped,
        }
    }

    /// Queue an attempt record without waiting.
    pub fn record(&self, mut entry: DeliveryAttemptLog) {
        entry.request_body = entry.request_body.map(|b| truncate_chars(b, self.truncate_len));
        entry.response_body = entry.response_body.map(|b| truncate_chars(b, self.truncate_len));

        let job_id = entry.job_id.clone();
        let attempt = entry.attempt;
        if let Err(err) = self.tx.try_send(LogCommand::Append(Box::new(entry))) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metric_inc("postback.log.dropped");
            let err = match err {
                mpsc::error::TrySendError::Full(_) => LogError::ChannelFull,
                mpsc::error::TrySendError::Closed(_) => LogError::ChannelClosed,
            };
            tracing::error!(job_id = %job_id, attempt, error = %err, "delivery attempt log dropped");
        }
    }

    /// Wait until every record queued before this call reached the sink.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Records lost to a full channel or a failing sink.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Cut `text` to at most `max_chars` characters.
pub fn truncate_chars(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    #[async_trait]
    impl DeliveryLogSink for FailingSink {
        async fn append(&self, _entry: &DeliveryAttemptLog) -> Result<(), LogError> {
            Err(LogError::Sink("disk full".to_string()))
        }
    }

    fn entry(job_id: &str, body: &str) -> DeliveryAttemptLog {
        DeliveryAttemptLog {
            job_id: job_id.to_string(),
            conversion_id: "c1".to_string(),
            attempt: 1,
            request_method: "GET".to_string(),
            request_url: "https://t.example".to_string(),
            request_body: None,
            request_headers: Vec::new(),
            response_code: Some(500),
            response_body: Some(body.to_string()),
            error: Some("tracker responded with HTTP 500".to_string()),
            error_kind: Some("http_status".to_string()),
            duration_ms: 3,
            created_at_ms: 0,
        }
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate_chars("héllo".to_string(), 2), "hé");
        assert_eq!(truncate_chars("abc".to_string(), 10), "abc");
    }

    #[tokio::test]
    async fn records_are_truncated_and_kept_in_order() {
        let sink = Arc::new(InMemoryDeliveryLog::new());
        let logger = DeliveryLogger::spawn(sink.clone(), 16, 4);

        logger.record(entry("job_a", "0123456789"));
        logger.record(entry("job_b", "xy"));
        logger.flush().await;

        let entries = sink.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].job_id, "job_a");
        assert_eq!(entries[0].response_body.as_deref(), Some("0123"));
        assert_eq!(entries[1].response_body.as_deref(), Some("xy"));
        assert_eq!(sink.failure_breakdown().await.get("http_status"), Some(&2));
    }

    #[tokio::test]
    async fn sink_failures_are_counted_not_raised() {
        let logger = DeliveryLogger::spawn(Arc::new(FailingSink), 16, 100);
        logger.record(entry("job_a", "x"));
        logger.flush().await;
        assert_eq!(logger.dropped(), 1);
    }
}
