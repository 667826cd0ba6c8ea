use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Notify};

use crate::delivery_log::{truncate_chars, DeliveryAttemptLog, DeliveryLogger};
use crate::error::{DeliveryOutcome, FailureReason};
use crate::profile::ProfileStore;
use crate::queue::{backoff_delay, duration_ms, now_millis, RetryScheduler};
use crate::request::{build_request, PreparedRequest};
use crate::types::{HttpMethod, QueueJob};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

pub const DEFAULT_MAX_CONCURRENT: usize = 10;

/// Shared, read-only context for all deliveries.
pub struct DeliveryContext {
    pub http_client: reqwest::Client,
    pub profiles: Arc<dyn ProfileStore>,
    pub logger: DeliveryLogger,
    /// Response bodies are read up to this many characters.
    pub body_limit: usize,
}

/// Tracker response to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: String,
}

impl HttpResponse {
    /// 2xx and 3xx count as delivered; the body is never inspected.
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status_code)
    }
}

struct PendingJob {
    job: QueueJob,
    route: Arc<dyn RetryScheduler>,
    done: Option<oneshot::Sender<DeliveryOutcome>>,
}

#[derive(Default)]
struct PoolState {
    active: usize,
    pending: VecDeque<PendingJob>,
}

struct PoolInner {
    ctx: Arc<DeliveryContext>,
    max_concurrent: usize,
    state: Mutex<PoolState>,
    peak_active: AtomicUsize,
    idle: Notify,
}

/// Bounded-concurrency delivery executor.
///
/// At most `max_concurrent` deliveries are in flight; further jobs wait in
/// a FIFO and start as soon as a slot frees. Retries are never run here
/// directly: they are handed to the job's [`RetryScheduler`] and come back
/// through `submit` when due, so no slot is held during backoff.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(ctx: Arc<DeliveryContext>, max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                ctx,
                max_concurrent: max_concurrent.max(1),
                state: Mutex::new(PoolState::default()),
                peak_active: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Queue `job` and return immediately.
    pub fn submit(&self, job: QueueJob, route: Arc<dyn RetryScheduler>) {
        self.inner.enqueue(PendingJob {
            job,
            route,
            done: None,
        });
    }

    /// Queue `job` and wait for the outcome of this attempt.
    pub async fn execute(&self, job: QueueJob, route: Arc<dyn RetryScheduler>) -> DeliveryOutcome {
        let (done_tx, done_rx) = oneshot::channel();
        let attempts = job.attempt;
        self.inner.enqueue(PendingJob {
            job,
            route,
            done: Some(done_tx),
        });

        done_rx.await.unwrap_or(DeliveryOutcome::Failed {
            reason: FailureReason::Network("delivery task aborted".to_string()),
            attempts,
        })
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    pub fn active_jobs(&self) -> usize {
        self.inner.lock_state().active
    }

    pub fn pending_jobs(&self) -> usize {
        self.inner.lock_state().pending.len()
    }

    /// Highest number of simultaneously active deliveries seen so far.
    pub fn peak_active(&self) -> usize {
        self.inner.peak_active.load(Ordering::SeqCst)
    }

    /// Whether a new job would start without queueing.
    pub fn has_capacity(&self) -> bool {
        let state = self.inner.lock_state();
        state.active + state.pending.len() < self.inner.max_concurrent
    }

    pub fn is_idle(&self) -> bool {
        self.inner.lock_state().is_idle()
    }

    /// Resolve once nothing is pending or active.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl PoolState {
    fn is_idle(&self) -> bool {
        self.active == 0 && self.pending.is_empty()
    }
}

impl PoolInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(self: &Arc<Self>, pending: PendingJob) {
        self.lock_state().pending.push_back(pending);
        self.dispatch();
    }

    /// Start queued jobs while slots are free.
    fn dispatch(self: &Arc<Self>) {
        let mut ready = Vec::new();
        {
            let mut state = self.lock_state();
            while state.active < self.max_concurrent {
                let Some(next) = state.pending.pop_front() else {
                    break;
                };
                state.active += 1;
                ready.push(next);
            }
            self.peak_active.fetch_max(state.active, Ordering::SeqCst);
        }

        for pending in ready {
            let inner = self.clone();
            tokio::spawn(inner.run(pending));
        }
    }

    async fn run(self: Arc<Self>, pending: PendingJob) {
        let PendingJob { job, route, done } = pending;
        let outcome = process_job(&self.ctx, job, route.as_ref()).await;

        let idle = {
            let mut state = self.lock_state();
            state.active = state.active.saturating_sub(1);
            state.is_idle()
        };
        self.dispatch();
        if idle {
            self.idle.notify_waiters();
        }

        if let Some(done) = done {
            let _ = done.send(outcome);
        }
    }
}

/// Run one attempt of `job` and settle it: finish, or schedule the retry.
async fn process_job(
    ctx: &DeliveryContext,
    job: QueueJob,
    route: &dyn RetryScheduler,
) -> DeliveryOutcome {
    let (result, backoff_base) = attempt_delivery(ctx, &job).await;

    match result {
        Ok(status_code) => {
            metric_inc("postback.delivery.success");
            tracing::info!(
                job_id = %job.job_id,
                conversion_id = %job.task.conversion_id,
                attempt = job.attempt,
                status = status_code,
                "postback delivered"
            );
            let outcome = DeliveryOutcome::Delivered { status_code };
            route.finish(&job, &outcome).await;
            outcome
        }

        Err(reason) if reason.is_transient() && job.has_attempts_left() => {
            let delay = backoff_delay(backoff_base, job.attempt);
            let next = job.next_attempt(delay);
            let next_attempt = next.attempt;

            match route.schedule(next, delay).await {
                Ok(()) => {
                    metric_inc("postback.delivery.retry_scheduled");
                    tracing::warn!(
                        job_id = %job.job_id,
                        attempt = job.attempt,
                        delay_ms = duration_ms(delay),
                        error = %reason,
                        "postback attempt failed, retry scheduled"
                    );
                    DeliveryOutcome::Retrying {
                        reason,
                        next_attempt,
                        delay_ms: duration_ms(delay),
                    }
                }
                Err(err) => {
                    tracing::error!(
                        job_id = %job.job_id,
                        attempt = job.attempt,
                        error = %err,
                        "retry could not be scheduled, giving up"
                    );
                    fail(route, &job, reason).await
                }
            }
        }

        Err(reason) => fail(route, &job, reason).await,
    }
}

async fn fail(route: &dyn RetryScheduler, job: &QueueJob, reason: FailureReason) -> DeliveryOutcome {
    metric_inc("postback.delivery.failed");
    tracing::error!(
        job_id = %job.job_id,
        conversion_id = %job.task.conversion_id,
        attempts = job.attempt,
        error = %reason,
        "postback permanently failed"
    );
    let outcome = DeliveryOutcome::Failed {
        reason,
        attempts: job.attempt,
    };
    route.finish(job, &outcome).await;
    outcome
}

/// One HTTP attempt plus its log record.
///
/// Returns the status code on success and the backoff base of the profile
/// used, so the caller can schedule a retry.
async fn attempt_delivery(ctx: &DeliveryContext, job: &QueueJob) -> (Result<u16, FailureReason>, u64) {
    let Some(profile) = ctx.profiles.profile_for(&job.task.advertiser_id).await else {
        let reason = FailureReason::MissingProfile;
        ctx.logger.record(attempt_log(job, None, None, Some(&reason), Duration::ZERO));
        return (Err(reason), 0);
    };

    let request = match build_request(&profile, &job.task) {
        Ok(request) => request,
        Err(reason) => {
            ctx.logger.record(attempt_log(job, None, None, Some(&reason), Duration::ZERO));
            return (Err(reason), profile.backoff_base_secs);
        }
    };

    tracing::debug!(job_id = %job.job_id, attempt = job.attempt, url = %request.url, "sending postback");
    let started = Instant::now();
    let timeout = Duration::from_millis(profile.timeout_ms);
    let response = send_request(&ctx.http_client, &request, timeout, ctx.body_limit).await;
    let elapsed = started.elapsed();

    let result = match &response {
        Ok(resp) if resp.is_success() => Ok(resp.status_code),
        Ok(resp) => Err(FailureReason::HttpStatus(resp.status_code)),
        Err(reason) => Err(reason.clone()),
    };

    ctx.logger.record(attempt_log(
        job,
        Some(&request),
        response.as_ref().ok(),
        result.as_ref().err(),
        elapsed,
    ));

    (result, profile.backoff_base_secs)
}

fn attempt_log(
    job: &QueueJob,
    request: Option<&PreparedRequest>,
    response: Option<&HttpResponse>,
    error: Option<&FailureReason>,
    elapsed: Duration,
) -> DeliveryAttemptLog {
    DeliveryAttemptLog {
        job_id: job.job_id.clone(),
        conversion_id: job.task.conversion_id.clone(),
        attempt: job.attempt,
        request_method: request.map(|r| r.method).unwrap_or_default().as_str().to_string(),
        request_url: request.map(|r| r.url.clone()).unwrap_or_default(),
        request_body: request.and_then(|r| r.body.clone()),
        request_headers: request.map(|r| r.headers.clone()).unwrap_or_default(),
        response_code: response.map(|r| r.status_code),
        response_body: response.map(|r| r.body.clone()),
        error: error.map(ToString::to_string),
        error_kind: error.map(|e| e.kind().to_string()),
        duration_ms: duration_ms(elapsed),
        created_at_ms: now_millis(),
    }
}

/// Send a rendered request, bounded by `timeout`.
///
/// At most `body_limit` characters of the response body are kept; the rest
/// is never read.
pub(crate) async fn send_request(
    client: &reqwest::Client,
    request: &PreparedRequest,
    timeout: Duration,
    body_limit: usize,
) -> Result<HttpResponse, FailureReason> {
    let mut builder = match request.method {
        HttpMethod::Get => client.get(&request.url),
        HttpMethod::Post => client.post(&request.url),
    };
    builder = builder.timeout(timeout);

    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }

    let mut response = builder.send().await.map_err(classify_error)?;
    let status_code = response.status().as_u16();

    // A UTF-8 character is at most four bytes.
    let byte_limit = body_limit.saturating_mul(4);
    let mut raw = Vec::new();
    while raw.len() < byte_limit {
        match response.chunk().await.map_err(classify_error)? {
            Some(chunk) => raw.extend_from_slice(&chunk),
            None => break,
        }
    }
    raw.truncate(byte_limit);
    let body = truncate_chars(String::from_utf8_lossy(&raw).into_owned(), body_limit);

    Ok(HttpResponse { status_code, body })
}

fn classify_error(err: reqwest::Error) -> FailureReason {
    if err.is_timeout() {
        FailureReason::Timeout
    } else if err.is_builder() {
        FailureReason::InvalidRequest(err.to_string())
    } else {
        FailureReason::Network(err.to_string())
    }
}
