use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{DeliveryOutcome, SchedulerError};
use crate::types::{ConversionStatus, ExecutionMode, PostbackTask, QueueJob, QueueStats};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Where retries of a job go.
///
/// Every job carries the scheduler of the path that dispatched it, so a
/// retry always travels back the same way: the broker's delayed set for
/// durable jobs, an in-process timer for autonomous ones.
#[async_trait]
pub trait RetryScheduler: Send + Sync {
    /// Run `job` again after `delay`.
    async fn schedule(&self, job: QueueJob, delay: Duration) -> Result<(), SchedulerError>;

    /// Record that `job` reached a terminal outcome.
    async fn finish(&self, job: &QueueJob, outcome: &DeliveryOutcome);
}

/// One way of executing tasks: durable broker or in-process.
#[async_trait]
pub trait ExecutionPath: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Take ownership of `task` for delivery.
    async fn accept(&self, task: PostbackTask) -> Result<DeliveryOutcome, SchedulerError>;

    async fn stats(&self) -> Result<QueueStats, SchedulerError>;
}

impl QueueJob {
    /// Wrap `task` as the first attempt of a new job.
    pub fn new(task: PostbackTask, max_attempts: u32, enqueued_at_ms: u64) -> Self {
        let delay = initial_delay(&task.conversion_status);
        Self {
            job_id: job_id_for(&task.conversion_id, enqueued_at_ms),
            task,
            attempt: 1,
            max_attempts: max_attempts.max(1),
            scheduled_delay_ms: duration_ms(delay),
        }
    }

    /// A job for a task that waited behind another one for its conversion.
    ///
    /// Starts without the status delay: the earlier task has already
    /// settled, which is the ordering that delay exists for.
    pub fn follow_up(task: PostbackTask, max_attempts: u32, enqueued_at_ms: u64) -> Self {
        Self {
            scheduled_delay_ms: 0,
            ..Self::new(task, max_attempts, enqueued_at_ms)
        }
    }

    /// The same job, one attempt later.
    pub fn next_attempt(&self, delay: Duration) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1).min(self.max_attempts),
            scheduled_delay_ms: duration_ms(delay),
            ..self.clone()
        }
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// `postback_{conversion_id}_{enqueue_epoch_millis}`.
pub fn job_id_for(conversion_id: &str, enqueued_at_ms: u64) -> String {
    format!("postback_{conversion_id}_{enqueued_at_ms}")
}

/// Delay before the first attempt, by conversion status.
///
/// Approvals and declines go out immediately; reversals wait 30s so the
/// original outcome lands first.
pub fn initial_delay(status: &ConversionStatus) -> Duration {
    match status {
        ConversionStatus::Approved | ConversionStatus::Declined => Duration::ZERO,
        ConversionStatus::Refunded | ConversionStatus::Chargeback => Duration::from_millis(30_000),
        _ => Duration::from_millis(5_000),
    }
}

/// `base_secs ^ attempt` seconds, where `attempt` is the attempt that failed.
pub fn backoff_delay(base_secs: u64, attempt: u32) -> Duration {
    let secs = base_secs.saturating_pow(attempt);
    Duration::from_millis(secs.saturating_mul(1_000))
}

pub fn duration_ms(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(duration_ms)
        .unwrap_or_default()
}

/// How a task was received by an [`InFlightGuard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Nothing was in flight; the caller now owns the conversion.
    Acquired,
    /// The same task is already live or waiting.
    Duplicate,
    /// Another task for the conversion is live; this one runs after it.
    Deferred,
}

#[derive(Debug)]
struct Slot {
    live: PostbackTask,
    follow_ups: VecDeque<PostbackTask>,
}

impl Slot {
    fn holds(&self, task: &PostbackTask) -> bool {
        self.live == *task || self.follow_ups.contains(task)
    }
}

/// Conversions with a delivery in flight on this process.
///
/// At most one task per conversion is live. Later, different tasks for the
/// same conversion queue behind it in arrival order and are handed out by
/// [`release`](Self::release) one at a time.
#[derive(Debug, Clone, Default)]
pub struct InFlightGuard {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl InFlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn admit(&self, task: &PostbackTask) -> Admission {
        let mut slots = self.lock();
        match slots.get_mut(&task.conversion_id) {
            Some(slot) if slot.holds(task) => Admission::Duplicate,
            Some(slot) => {
                slot.follow_ups.push_back(task.clone());
                Admission::Deferred
            }
            None => {
                slots.insert(
                    task.conversion_id.clone(),
                    Slot {
                        live: task.clone(),
                        follow_ups: VecDeque::new(),
                    },
                );
                Admission::Acquired
            }
        }
    }

    /// Take the conversion only if nothing is in flight for it.
    pub fn try_hold(&self, task: &PostbackTask) -> bool {
        let mut slots = self.lock();
        if slots.contains_key(&task.conversion_id) {
            return false;
        }
        slots.insert(
            task.conversion_id.clone(),
            Slot {
                live: task.clone(),
                follow_ups: VecDeque::new(),
            },
        );
        true
    }

    /// End the live task. Returns the next follow-up, which is live from
    /// now on and must be dispatched by the caller.
    pub fn release(&self, conversion_id: &str) -> Option<PostbackTask> {
        let mut slots = self.lock();
        let slot = slots.get_mut(conversion_id)?;
        match slot.follow_ups.pop_front() {
            Some(next) => {
                slot.live = next.clone();
                Some(next)
            }
            None => {
                slots.remove(conversion_id);
                None
            }
        }
    }

    pub fn contains(&self, conversion_id: &str) -> bool {
        self.lock().contains_key(conversion_id)
    }

    /// Whether `task` is exactly the live task or an already queued one.
    pub fn is_duplicate(&self, task: &PostbackTask) -> bool {
        self.lock()
            .get(&task.conversion_id)
            .is_some_and(|slot| slot.holds(task))
    }

    /// Forget every conversion, returning how many were held.
    pub fn clear(&self) -> usize {
        let mut slots = self.lock();
        let held = slots.len();
        slots.clear();
        held
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::build_task;
    use crate::types::{ConversionRecord, ConversionType};

    fn task(status: &str) -> PostbackTask {
        build_task(&ConversionRecord::new(
            "c1",
            "adv",
            "clk1",
            ConversionType::Purchase,
            status,
        ))
    }

    #[test]
    fn backoff_is_base_to_the_attempt() {
        assert_eq!(backoff_delay(2, 3), Duration::from_millis(8_000));
        assert_eq!(backoff_delay(2, 1), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(3, 2), Duration::from_millis(9_000));
    }

    #[test]
    fn backoff_saturates() {
        assert_eq!(backoff_delay(u64::MAX, 4), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn job_id_is_deterministic() {
        let a = QueueJob::new(task("approved"), 5, 1_700_000_000_123);
        let b = QueueJob::new(task("approved"), 5, 1_700_000_000_123);
        assert_eq!(a.job_id, "postback_c1_1700000000123");
        assert_eq!(a.job_id, b.job_id);
        assert_eq!(a.attempt, 1);
    }

    #[test]
    fn initial_delay_depends_on_status() {
        assert_eq!(QueueJob::new(task("approved"), 5, 0).scheduled_delay_ms, 0);
        assert_eq!(QueueJob::new(task("declined"), 5, 0).scheduled_delay_ms, 0);
        assert_eq!(QueueJob::new(task("refunded"), 5, 0).scheduled_delay_ms, 30_000);
        assert_eq!(QueueJob::new(task("chargeback"), 5, 0).scheduled_delay_ms, 30_000);
        assert_eq!(QueueJob::new(task("pending"), 5, 0).scheduled_delay_ms, 5_000);
    }

    #[test]
    fn follow_up_skips_status_delay() {
        let job = QueueJob::follow_up(task("chargeback"), 5, 7);
        assert_eq!(job.scheduled_delay_ms, 0);
        assert_eq!(job.job_id, "postback_c1_7");
    }

    #[test]
    fn attempt_never_exceeds_max() {
        let mut job = QueueJob::new(task("approved"), 2, 0);
        assert!(job.has_attempts_left());
        job = job.next_attempt(Duration::from_secs(2));
        assert_eq!(job.attempt, 2);
        assert!(!job.has_attempts_left());
        job = job.next_attempt(Duration::from_secs(4));
        assert_eq!(job.attempt, 2);
    }

    #[test]
    fn guard_rejects_identical_task() {
        let guard = InFlightGuard::new();
        assert_eq!(guard.admit(&task("approved")), Admission::Acquired);
        assert_eq!(guard.admit(&task("approved")), Admission::Duplicate);
        assert!(guard.is_duplicate(&task("approved")));
        assert_eq!(guard.release("c1"), None);
        assert_eq!(guard.admit(&task("approved")), Admission::Acquired);
    }

    #[test]
    fn status_change_queues_behind_live_task() {
        let guard = InFlightGuard::new();
        assert_eq!(guard.admit(&task("approved")), Admission::Acquired);
        assert_eq!(guard.admit(&task("refunded")), Admission::Deferred);
        assert_eq!(guard.admit(&task("chargeback")), Admission::Deferred);
        assert_eq!(guard.admit(&task("refunded")), Admission::Duplicate);

        assert_eq!(guard.release("c1"), Some(task("refunded")));
        assert!(guard.contains("c1"));
        assert_eq!(guard.admit(&task("refunded")), Admission::Duplicate);
        assert_eq!(guard.release("c1"), Some(task("chargeback")));
        assert_eq!(guard.release("c1"), None);
        assert!(!guard.contains("c1"));
    }

    #[test]
    fn hold_only_succeeds_on_idle_conversion() {
        let guard = InFlightGuard::new();
        assert!(guard.try_hold(&task("approved")));
        assert!(!guard.try_hold(&task("approved")));
        assert_eq!(guard.admit(&task("chargeback")), Admission::Deferred);
        assert_eq!(guard.release("c1"), Some(task("chargeback")));
        assert_eq!(guard.clear(), 1);
        assert!(!guard.contains("c1"));
    }
}
