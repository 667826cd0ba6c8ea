use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::autonomous::AutonomousProcessor;
use crate::broker::BrokerConnection;
use crate::config::EngineConfig;
use crate::delivery_log::{DeliveryLogSink, DeliveryLogger};
use crate::error::{DeliveryOutcome, InitError, SchedulerError, SubmitError};
use crate::profile::ProfileStore;
use crate::queue::{duration_ms, ExecutionPath};
use crate::queue_redis::RedisQueue;
use crate::request::{assemble, RequestParts};
use crate::template::Macros;
use crate::trigger::task_for;
use crate::types::{
    ConversionRecord, ExecutionMode, HttpMethod, QueueStats, QueueStatsReport, SignatureConfig,
};
use crate::worker::{send_request, DeliveryContext, WorkerPool};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Signed when an operator supplies a secret but no signature template.
pub const DEFAULT_TEST_SIGNATURE_TEMPLATE: &str = "{click_id}:{txid}:{status}";

const DEFAULT_TEST_TIMEOUT_MS: u64 = 10_000;

/// What happened to a submitted conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Status does not warrant a postback.
    Ignored,
    Accepted {
        mode: ExecutionMode,
        outcome: DeliveryOutcome,
    },
}

/// Operator request for a one-off trial delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct TestDeliveryRequest {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub macros: HashMap<String, String>,
    pub signing_secret: Option<String>,
    pub signature_template: Option<String>,
    pub signature_param: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl TestDeliveryRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            macros: HashMap::new(),
            signing_secret: None,
            signature_template: None,
            signature_param: None,
            timeout_ms: None,
        }
    }

    pub fn with_macro(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.macros.insert(name.into(), value.into());
        self
    }

    pub fn with_signing_secret(mut self, secret: impl Into<String>) -> Self {
        self.signing_secret = Some(secret.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestDeliveryResult {
    pub success: bool,
    pub status_code: Option<u16>,
    /// Truncated to the configured log length.
    pub response_body: Option<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// The postback delivery engine.
///
/// Owns the worker pool, the broker connection and both execution paths.
/// The durable path is chosen at startup when a broker is configured; the
/// autonomous path is always present and takes over whenever a durable
/// enqueue fails.
pub struct PostbackEngine {
    config: EngineConfig,
    broker: Arc<BrokerConnection>,
    durable: Option<Arc<RedisQueue>>,
    autonomous: Arc<AutonomousProcessor>,
    paths: Vec<Arc<dyn ExecutionPath>>,
    pool: WorkerPool,
    logger: DeliveryLogger,
    http_client: reqwest::Client,
    is_running: Arc<AtomicBool>,
    wake: Arc<Notify>,
    consumer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PostbackEngine {
    /// Build the engine, probe the broker once and start the durable consumer.
    pub async fn start(
        config: EngineConfig,
        profiles: Arc<dyn ProfileStore>,
        log_sink: Arc<dyn DeliveryLogSink>,
    ) -> Result<Self, InitError> {
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(config.user_agent.as_str())
            .build()?;

        let logger = DeliveryLogger::spawn(
            log_sink,
            config.log_channel_capacity,
            config.log_truncate_len,
        );

        let ctx = Arc::new(DeliveryContext {
            http_client: http_client.clone(),
            profiles,
            logger: logger.clone(),
            body_limit: config.log_truncate_len,
        });
        let pool = WorkerPool::new(ctx, config.max_concurrent);

        let broker = Arc::new(BrokerConnection::new(
            config.redis_url.clone(),
            config.probe_timeout(),
            config.reprobe_interval(),
        ));
        let autonomous = Arc::new(AutonomousProcessor::new(pool.clone(), config.max_attempts));

        let durable = broker.is_configured().then(|| {
            Arc::new(
                RedisQueue::new(
                    broker.clone(),
                    config.queue_prefix.clone(),
                    config.max_attempts,
                    config.retention,
                    Duration::from_secs(config.inflight_ttl_secs),
                )
                .with_stall_timeout(config.stall_timeout())
                .with_local_path(autonomous.clone()),
            )
        });

        let mut paths: Vec<Arc<dyn ExecutionPath>> = Vec::new();
        if let Some(queue) = &durable {
            paths.push(queue.clone());
        }
        paths.push(autonomous.clone());

        let is_running = Arc::new(AtomicBool::new(true));
        let wake = Arc::new(Notify::new());

        let mode = if durable.is_some() {
            broker.mode().await
        } else {
            ExecutionMode::Autonomous
        };

        let consumer_handle = durable.as_ref().map(|queue| {
            queue.spawn_consumer(
                pool.clone(),
                is_running.clone(),
                wake.clone(),
                config.poll_interval(),
            )
        });

        tracing::info!(
            mode = %mode,
            max_concurrent = config.max_concurrent,
            max_attempts = config.max_attempts,
            "postback engine started"
        );

        Ok(Self {
            config,
            broker,
            durable,
            autonomous,
            paths,
            pool,
            logger,
            http_client,
            is_running,
            wake,
            consumer_handle: Mutex::new(consumer_handle),
        })
    }

    /// Hand a finalized conversion to the engine.
    ///
    /// Fails only when no execution path accepted the task.
    pub async fn submit_for_delivery(
        &self,
        record: &ConversionRecord,
    ) -> Result<Submission, SubmitError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(SubmitError::Shutdown);
        }

        let Some(task) = task_for(record) else {
            metric_inc("postback.submit.ignored");
            return Ok(Submission::Ignored);
        };

        if self.autonomous.is_duplicate(&task) {
            metric_inc("postback.submit.duplicate");
            return Ok(Submission::Accepted {
                mode: ExecutionMode::Autonomous,
                outcome: DeliveryOutcome::Duplicate,
            });
        }

        let mut last_error = None;
        for path in &self.paths {
            match path.accept(task.clone()).await {
                Ok(outcome) => {
                    match outcome {
                        DeliveryOutcome::Duplicate => metric_inc("postback.submit.duplicate"),
                        DeliveryOutcome::Deferred => metric_inc("postback.submit.deferred"),
                        _ => {}
                    }
                    if path.mode() == ExecutionMode::Durable {
                        self.wake.notify_one();
                    }
                    return Ok(Submission::Accepted {
                        mode: path.mode(),
                        outcome,
                    });
                }
                Err(err) => {
                    if let SchedulerError::Broker(broker_err) = &err {
                        if broker_err.is_connection_error() {
                            self.broker.invalidate(&broker_err.to_string()).await;
                        }
                        metric_inc("postback.broker.failover");
                    }
                    tracing::warn!(
                        conversion_id = %task.conversion_id,
                        mode = %path.mode(),
                        error = %err,
                        "execution path rejected task"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(SubmitError::Rejected {
            conversion_id: task.conversion_id,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no execution path available".to_string()),
        })
    }

    /// Queue statistics for the monitoring dashboard.
    ///
    /// Never fails: when the broker cannot be queried the in-process
    /// counters are returned with `error` set.
    pub async fn queue_stats(&self) -> QueueStatsReport {
        let Some(durable) = &self.durable else {
            return QueueStatsReport {
                mode: ExecutionMode::Autonomous,
                stats: self.autonomous.local_stats(),
                error: None,
            };
        };

        match durable.stats().await {
            Ok(stats) => QueueStatsReport {
                mode: ExecutionMode::Durable,
                stats,
                error: None,
            },
            Err(err) => {
                if err.is_connection_error() {
                    self.broker.invalidate(&err.to_string()).await;
                }
                QueueStatsReport {
                    mode: ExecutionMode::Autonomous,
                    stats: self.autonomous.local_stats(),
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Counters of the in-process path only.
    pub fn local_stats(&self) -> QueueStats {
        self.autonomous.local_stats()
    }

    /// Perform one trial delivery for an operator.
    pub async fn test_delivery(&self, request: &TestDeliveryRequest) -> TestDeliveryResult {
        test_delivery(&self.http_client, request, self.config.log_truncate_len).await
    }

    /// Where a submission would go right now.
    pub async fn mode(&self) -> ExecutionMode {
        match &self.durable {
            Some(_) => self.broker.mode().await,
            None => ExecutionMode::Autonomous,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn logger(&self) -> &DeliveryLogger {
        &self.logger
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop accepting work, stop the consumer and wait for in-flight
    /// deliveries.
    ///
    /// Pending in-process timers are cancelled, so no delivery starts after
    /// this returns. Attempts still running finish, but their retries are
    /// not scheduled. Durable jobs are unaffected and resume on the next
    /// start.
    pub async fn shutdown(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.autonomous.close();
        let abandoned = self.autonomous.cancel_timers();
        self.wake.notify_waiters();

        if let Some(handle) = self.consumer_handle.lock().await.take() {
            let _ = handle.await;
        }

        self.pool.wait_idle().await;
        self.logger.flush().await;

        if abandoned > 0 {
            tracing::warn!(abandoned, "pending in-process deliveries cancelled at shutdown");
        }
        tracing::info!("postback engine stopped");
    }
}

/// One synchronous trial delivery with no retry and no attempt log.
pub async fn test_delivery(
    client: &reqwest::Client,
    request: &TestDeliveryRequest,
    truncate_len: usize,
) -> TestDeliveryResult {
    let signature = SignatureConfig {
        enabled: request.signing_secret.is_some(),
        secret: request.signing_secret.clone().unwrap_or_default(),
        payload_template: request
            .signature_template
            .clone()
            .unwrap_or_else(|| DEFAULT_TEST_SIGNATURE_TEMPLATE.to_string()),
        param_name: request
            .signature_param
            .clone()
            .unwrap_or_else(|| SignatureConfig::default().param_name),
        ..SignatureConfig::default()
    };
    let macros = Macros::from(request.macros.clone());
    let parts = RequestParts {
        method: request.method,
        url_template: &request.url,
        body_template: None,
        signature: &signature,
        auth: None,
    };

    let started = Instant::now();
    let prepared = match assemble(&parts, &macros) {
        Ok(prepared) => prepared,
        Err(reason) => {
            return TestDeliveryResult {
                success: false,
                status_code: None,
                response_body: None,
                duration_ms: 0,
                error: Some(reason.to_string()),
            }
        }
    };

    let timeout = Duration::from_millis(request.timeout_ms.unwrap_or(DEFAULT_TEST_TIMEOUT_MS));
    let response = send_request(client, &prepared, timeout, truncate_len).await;
    let elapsed = duration_ms(started.elapsed());

    match response {
        Ok(resp) => TestDeliveryResult {
            success: resp.is_success(),
            status_code: Some(resp.status_code),
            response_body: Some(resp.body),
            duration_ms: elapsed,
            error: None,
        },
        Err(reason) => TestDeliveryResult {
            success: false,
            status_code: None,
            response_body: None,
            duration_ms: elapsed,
            error: Some(reason.to_string()),
        },
    }
}
