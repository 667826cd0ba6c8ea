//! In-process fallback used while the durable broker is unreachable.
//!
//! Delivery semantics are the same as on the durable path: the same worker
//! pool renders, signs, sends and classifies every attempt. Only retry
//! scheduling differs, using tokio timers instead of the broker's delayed
//! set.
//!
//! **Limitation:** timers live in process memory. Retries and delayed first
//! attempts that are still pending at shutdown are cancelled; they are not
//! written anywhere and are not recovered on restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::AbortHandle;

use crate::error::{DeliveryOutcome, SchedulerError};
use crate::queue::{now_millis, Admission, ExecutionPath, InFlightGuard, RetryScheduler};
use crate::types::{ExecutionMode, PostbackTask, QueueJob, QueueStats};
use crate::worker::WorkerPool;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[derive(Default)]
struct LocalCounters {
    delayed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Retry scheduling on in-process timers.
#[derive(Clone)]
pub struct InProcessScheduler {
    pool: WorkerPool,
    guard: InFlightGuard,
    max_attempts: u32,
    counters: Arc<LocalCounters>,
    closed: Arc<AtomicBool>,
    timers: Arc<Mutex<HashMap<u64, AbortHandle>>>,
    next_timer: Arc<AtomicU64>,
}

impl InProcessScheduler {
    pub fn new(pool: WorkerPool, max_attempts: u32) -> Self {
        Self {
            pool,
            guard: InFlightGuard::new(),
            max_attempts,
            counters: Arc::new(LocalCounters::default()),
            closed: Arc::new(AtomicBool::new(false)),
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_timer: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock_timers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, AbortHandle>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self) -> Arc<dyn RetryScheduler> {
        Arc::new(self.clone())
    }

    fn submit_after(&self, job: QueueJob, delay: Duration) {
        let timer_id = self.next_timer.fetch_add(1, Ordering::SeqCst);
        self.counters.delayed.fetch_add(1, Ordering::SeqCst);

        // Registered before the timer can fire, so the task always finds
        // its own entry unless it was cancelled.
        let mut timers = self.lock_timers();
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if scheduler.lock_timers().remove(&timer_id).is_none() {
                return;
            }
            scheduler.counters.delayed.fetch_sub(1, Ordering::SeqCst);
            scheduler.pool.submit(job, scheduler.route());
        });
        timers.insert(timer_id, handle.abort_handle());
    }

    fn dispatch(&self, job: QueueJob) {
        if job.scheduled_delay_ms > 0 {
            let delay = Duration::from_millis(job.scheduled_delay_ms);
            self.submit_after(job, delay);
        } else {
            self.pool.submit(job, self.route());
        }
    }

    /// Close the live task of a conversion and start whatever waited behind it.
    fn settle(&self, conversion_id: &str) {
        let Some(next) = self.guard.release(conversion_id) else {
            return;
        };
        if self.is_closed() {
            tracing::warn!(conversion_id, "follow-up postback abandoned at shutdown");
            return;
        }

        metric_inc("postback.enqueue.autonomous");
        let job = QueueJob::follow_up(next, self.max_attempts, now_millis());
        tracing::debug!(
            job_id = %job.job_id,
            status = %job.task.conversion_status,
            "starting follow-up postback"
        );
        self.dispatch(job);
    }

    /// Abort every pending timer. Returns how many were cancelled.
    fn cancel_timers(&self) -> usize {
        let cancelled: Vec<AbortHandle> = self.lock_timers().drain().map(|(_, h)| h).collect();
        for handle in &cancelled {
            handle.abort();
        }
        self.counters
            .delayed
            .fetch_sub(cancelled.len() as u64, Ordering::SeqCst);
        cancelled.len()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RetryScheduler for InProcessScheduler {
    async fn schedule(&self, job: QueueJob, delay: Duration) -> Result<(), SchedulerError> {
        if self.is_closed() {
            return Err(SchedulerError::Closed);
        }
        self.submit_after(job, delay);
        Ok(())
    }

    async fn finish(&self, job: &QueueJob, outcome: &DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Delivered { .. } => &self.counters.completed,
            _ => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.settle(&job.task.conversion_id);
    }
}

/// Synchronous, non-durable delivery of tasks.
pub struct AutonomousProcessor {
    scheduler: InProcessScheduler,
}

impl AutonomousProcessor {
    pub fn new(pool: WorkerPool, max_attempts: u32) -> Self {
        Self {
            scheduler: InProcessScheduler::new(pool, max_attempts),
        }
    }

    /// Deliver `task` in-process.
    ///
    /// Immediate tasks run their first attempt before this returns and the
    /// outcome of that attempt is returned; later retries run on timers.
    /// Tasks with a status-dependent initial delay return `Scheduled`. A
    /// task for a conversion that is already in flight returns `Deferred`
    /// and starts once the live task settles.
    pub async fn process(&self, task: PostbackTask) -> Result<DeliveryOutcome, SchedulerError> {
        if self.scheduler.is_closed() {
            return Err(SchedulerError::Closed);
        }

        match self.scheduler.guard.admit(&task) {
            Admission::Acquired => {}
            Admission::Duplicate => {
                tracing::debug!(conversion_id = %task.conversion_id, "identical task already in flight");
                return Ok(DeliveryOutcome::Duplicate);
            }
            Admission::Deferred => {
                tracing::info!(
                    conversion_id = %task.conversion_id,
                    status = %task.conversion_status,
                    "conversion in flight, postback deferred"
                );
                return Ok(DeliveryOutcome::Deferred);
            }
        }

        metric_inc("postback.enqueue.autonomous");
        let job = QueueJob::new(task, self.scheduler.max_attempts, now_millis());
        tracing::debug!(job_id = %job.job_id, delay_ms = job.scheduled_delay_ms, "processing autonomously");

        if job.scheduled_delay_ms > 0 {
            let delay_ms = job.scheduled_delay_ms;
            self.scheduler.submit_after(job, Duration::from_millis(delay_ms));
            return Ok(DeliveryOutcome::Scheduled { delay_ms });
        }

        Ok(self.scheduler.pool.execute(job, self.scheduler.route()).await)
    }

    pub fn is_in_flight(&self, conversion_id: &str) -> bool {
        self.scheduler.guard.contains(conversion_id)
    }

    pub fn is_duplicate(&self, task: &PostbackTask) -> bool {
        self.scheduler.guard.is_duplicate(task)
    }

    /// Mark a task run by another path as in flight here, so no in-process
    /// attempt for its conversion can overlap it. False if one already is.
    pub fn hold(&self, task: &PostbackTask) -> bool {
        self.scheduler.guard.try_hold(task)
    }

    /// End a [`hold`](Self::hold). Tasks deferred behind it start here.
    pub fn release_hold(&self, conversion_id: &str) {
        self.scheduler.settle(conversion_id);
    }

    /// In-process counters; `waiting` covers timers and the pool FIFO.
    pub fn local_stats(&self) -> QueueStats {
        let counters = &self.scheduler.counters;
        QueueStats::new(
            counters.delayed.load(Ordering::SeqCst) + self.scheduler.pool.pending_jobs() as u64,
            self.scheduler.pool.active_jobs() as u64,
            counters.completed.load(Ordering::SeqCst),
            counters.failed.load(Ordering::SeqCst),
        )
    }

    /// Refuse new tasks and new retries.
    pub fn close(&self) {
        self.scheduler.closed.store(true, Ordering::SeqCst);
    }

    /// Abort every pending timer; their jobs are dropped. Returns how many
    /// were cancelled.
    pub fn cancel_timers(&self) -> usize {
        self.scheduler.cancel_timers()
    }

    /// Timers not yet fired.
    pub fn delayed_jobs(&self) -> u64 {
        self.scheduler.counters.delayed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionPath for AutonomousProcessor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Autonomous
    }

    async fn accept(&self, task: PostbackTask) -> Result<DeliveryOutcome, SchedulerError> {
        self.process(task).await
    }

    async fn stats(&self) -> Result<QueueStats, SchedulerError> {
        Ok(self.local_stats())
    }
}
