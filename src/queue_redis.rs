use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::autonomous::AutonomousProcessor;
use crate::broker::BrokerConnection;
use crate::error::{BrokerError, DeliveryOutcome, SchedulerError};
use crate::queue::{duration_ms, job_id_for, now_millis, ExecutionPath, RetryScheduler};
use crate::types::{ExecutionMode, PostbackTask, QueueJob, QueueStats};
use crate::worker::WorkerPool;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Due delayed jobs moved to the wait list per consumer pass.
const PROMOTE_BATCH: usize = 100;

/// Stalled claims returned to the wait list per consumer pass.
const RECOVER_BATCH: usize = 100;

/// A claimed job older than this is presumed abandoned by a dead consumer.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(300);

/// How long a claimed job waits when its conversion is busy in-process.
const BUSY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Attempts at settling a job while follow-ups keep arriving.
const SLOT_RETRIES: usize = 5;

const CLAIM_SCRIPT: &str = r"
local id = redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT')
if id then
  redis.call('ZADD', KEYS[3], ARGV[1], id)
end
return id
";

const PROMOTE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('RPUSH', KEYS[2], id)
end
return #due
";

const RECOVER_SCRIPT: &str = r"
local stale = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local moved = 0
for _, id in ipairs(stale) do
  redis.call('ZREM', KEYS[1], id)
  if redis.call('LREM', KEYS[2], 1, id) > 0 then
    redis.call('RPUSH', KEYS[3], id)
    moved = moved + 1
  end
end
return moved
";

const DEFER_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('RPUSH', KEYS[2], ARGV[1])
redis.call('PEXPIRE', KEYS[2], ARGV[2])
return 1
";

// Settles a job and, if a follow-up is queued for its conversion, turns the
// head follow-up into the new live job. Returns -1 without writing anything
// when the head is not the one the caller prepared a job for.
const COMPLETE_SCRIPT: &str = r"
local head = redis.call('LINDEX', KEYS[6], 0)
if (head or '') ~= ARGV[3] then
  return -1
end
redis.call('LREM', KEYS[1], 1, ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('DEL', KEYS[3])
redis.call('LPUSH', KEYS[5], ARGV[1])
redis.call('LTRIM', KEYS[5], 0, tonumber(ARGV[2]))
if head then
  redis.call('LPOP', KEYS[6])
  redis.call('SET', KEYS[7], ARGV[5])
  redis.call('SET', KEYS[4], ARGV[4], 'PX', tonumber(ARGV[6]))
  redis.call('RPUSH', KEYS[8], ARGV[4])
  return 1
end
redis.call('DEL', KEYS[4])
return 0
";

struct QueueScripts {
    claim: Script,
    promote: Script,
    recover: Script,
    defer: Script,
    complete: Script,
}

impl QueueScripts {
    fn new() -> Self {
        Self {
            claim: Script::new(CLAIM_SCRIPT),
            promote: Script::new(PROMOTE_SCRIPT),
            recover: Script::new(RECOVER_SCRIPT),
            defer: Script::new(DEFER_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
        }
    }
}

/// Durable queue adapter over Redis.
///
/// Key layout under `prefix`:
/// - `{prefix}:wait`: list of job ids ready to run
/// - `{prefix}:delayed`: zset of job ids scored by due time (epoch ms)
/// - `{prefix}:active`: list of job ids claimed by a consumer
/// - `{prefix}:active_since`: zset of claimed job ids scored by claim time
/// - `{prefix}:completed`, `{prefix}:failed`: most recent terminal job ids
/// - `{prefix}:job:{job_id}`: JSON-encoded [`QueueJob`]
/// - `{prefix}:inflight:{conversion_id}`: id of the live job for a conversion
/// - `{prefix}:next:{conversion_id}`: tasks waiting for that job to settle
///
/// A claim whose consumer never settles it is returned to the wait list
/// after the stall timeout, so the timeout must exceed the longest tracker
/// timeout of any profile.
pub struct RedisQueue {
    broker: Arc<BrokerConnection>,
    prefix: String,
    max_attempts: u32,
    retention: usize,
    inflight_ttl: Duration,
    stall_timeout: Duration,
    local: Option<Arc<AutonomousProcessor>>,
    scripts: QueueScripts,
}

impl RedisQueue {
    pub fn new(
        broker: Arc<BrokerConnection>,
        prefix: impl Into<String>,
        max_attempts: u32,
        retention: usize,
        inflight_ttl: Duration,
    ) -> Self {
        Self {
            broker,
            prefix: prefix.into(),
            max_attempts,
            retention: retention.max(1),
            inflight_ttl,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            local: None,
            scripts: QueueScripts::new(),
        }
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Share in-flight tracking with the in-process path.
    ///
    /// Claimed jobs are then held in its guard while they run, and tasks it
    /// deferred behind them start there once they settle.
    pub fn with_local_path(mut self, local: Arc<AutonomousProcessor>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn wait_key(&self) -> String {
        format!("{}:wait", self.prefix)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.prefix)
    }

    fn active_since_key(&self) -> String {
        format!("{}:active_since", self.prefix)
    }

    fn completed_key(&self) -> String {
        format!("{}:completed", self.prefix)
    }

    fn failed_key(&self) -> String {
        format!("{}:failed", self.prefix)
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    fn inflight_key(&self, conversion_id: &str) -> String {
        format!("{}:inflight:{}", self.prefix, conversion_id)
    }

    fn next_key(&self, conversion_id: &str) -> String {
        format!("{}:next:{}", self.prefix, conversion_id)
    }

    fn inflight_ttl_ms(&self) -> u64 {
        duration_ms(self.inflight_ttl).max(1)
    }

    fn retention_end(&self) -> isize {
        isize::try_from(self.retention).unwrap_or(isize::MAX).saturating_sub(1)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.broker.connection().await
    }

    /// Create a job for `task` and queue it with its status-dependent delay.
    ///
    /// When the conversion already has a live job, an identical task returns
    /// `Duplicate` and any other task is kept behind it and returns
    /// `Deferred`. Connection failures are returned so the caller can fail
    /// over instead of dropping the task.
    pub async fn enqueue(&self, task: PostbackTask) -> Result<DeliveryOutcome, BrokerError> {
        let mut conn = self.connection().await?;

        for _ in 0..SLOT_RETRIES {
            let now = now_millis();
            let job = QueueJob::new(task.clone(), self.max_attempts, now);
            let inflight_key = self.inflight_key(&job.task.conversion_id);

            let claimed: Option<String> = redis::cmd("SET")
                .arg(&inflight_key)
                .arg(&job.job_id)
                .arg("NX")
                .arg("PX")
                .arg(self.inflight_ttl_ms())
                .query_async(&mut conn)
                .await?;

            if claimed.is_some() {
                return self.queue_new(&mut conn, job, now).await;
            }
            if let Some(outcome) = self.defer(&mut conn, &task).await? {
                return Ok(outcome);
            }
            // The live job settled in between; try to become the live job.
        }

        Err(BrokerError::Command(format!(
            "conversion {} kept changing hands",
            task.conversion_id
        )))
    }

    async fn queue_new(
        &self,
        conn: &mut MultiplexedConnection,
        job: QueueJob,
        now: u64,
    ) -> Result<DeliveryOutcome, BrokerError> {
        let inflight_key = self.inflight_key(&job.task.conversion_id);
        let payload = serde_json::to_string(&job)?;
        let mut pipe = redis::pipe();
        pipe.atomic().set(self.job_key(&job.job_id), payload).ignore();
        if job.scheduled_delay_ms == 0 {
            pipe.rpush(self.wait_key(), &job.job_id).ignore();
        } else {
            pipe.zadd(
                self.delayed_key(),
                &job.job_id,
                now.saturating_add(job.scheduled_delay_ms),
            )
            .ignore();
        }

        let queued: redis::RedisResult<()> = pipe.query_async(conn).await;
        if let Err(err) = queued {
            let _: Result<(), _> = conn.del(&inflight_key).await;
            return Err(err.into());
        }

        metric_inc("postback.enqueue.durable");
        tracing::debug!(
            job_id = %job.job_id,
            delay_ms = job.scheduled_delay_ms,
            "postback job enqueued"
        );
        Ok(DeliveryOutcome::Scheduled {
            delay_ms: job.scheduled_delay_ms,
        })
    }

    /// Queue `task` behind the live job of its conversion. `None` when
    /// there is no live job any more.
    async fn defer(
        &self,
        conn: &mut MultiplexedConnection,
        task: &PostbackTask,
    ) -> Result<Option<DeliveryOutcome>, BrokerError> {
        let inflight_key = self.inflight_key(&task.conversion_id);
        let next_key = self.next_key(&task.conversion_id);

        let live_id: Option<String> = conn.get(&inflight_key).await?;
        if let Some(live_id) = live_id {
            let live: Option<String> = conn.get(self.job_key(&live_id)).await?;
            let same = live
                .and_then(|payload| serde_json::from_str::<QueueJob>(&payload).ok())
                .is_some_and(|live| live.task == *task);
            if same {
                return Ok(Some(DeliveryOutcome::Duplicate));
            }
        }

        let queued: Vec<String> = conn.lrange(&next_key, 0, -1).await?;
        let already_queued = queued
            .iter()
            .filter_map(|payload| serde_json::from_str::<PostbackTask>(payload).ok())
            .any(|queued| queued == *task);
        if already_queued {
            return Ok(Some(DeliveryOutcome::Duplicate));
        }

        let payload = serde_json::to_string(task)?;
        let deferred: i64 = self
            .scripts
            .defer
            .key(&inflight_key)
            .key(&next_key)
            .arg(payload)
            .arg(self.inflight_ttl_ms())
            .invoke_async(conn)
            .await?;
        if deferred == 0 {
            return Ok(None);
        }

        tracing::info!(
            conversion_id = %task.conversion_id,
            status = %task.conversion_status,
            "conversion has a live job, postback deferred"
        );
        Ok(Some(DeliveryOutcome::Deferred))
    }

    /// Job counts; `waiting` includes delayed jobs.
    pub async fn stats(&self) -> Result<QueueStats, BrokerError> {
        let mut conn = self.connection().await?;
        let (wait, delayed, active, completed, failed): (u64, u64, u64, u64, u64) = redis::pipe()
            .llen(self.wait_key())
            .zcard(self.delayed_key())
            .llen(self.active_key())
            .llen(self.completed_key())
            .llen(self.failed_key())
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats::new(wait + delayed, active, completed, failed))
    }

    /// Move delayed jobs whose due time has passed onto the wait list.
    pub async fn promote_due(&self) -> Result<usize, BrokerError> {
        let mut conn = self.connection().await?;
        let promoted: usize = self
            .scripts
            .promote
            .key(self.delayed_key())
            .key(self.wait_key())
            .arg(now_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(promoted)
    }

    /// Return claims older than `stall_timeout` to the wait list.
    pub async fn recover_stalled(&self, stall_timeout: Duration) -> Result<usize, BrokerError> {
        let mut conn = self.connection().await?;
        let cutoff = now_millis().saturating_sub(duration_ms(stall_timeout));
        let recovered: usize = self
            .scripts
            .recover
            .key(self.active_since_key())
            .key(self.active_key())
            .key(self.wait_key())
            .arg(cutoff)
            .arg(RECOVER_BATCH)
            .invoke_async(&mut conn)
            .await?;
        if recovered > 0 {
            tracing::warn!(recovered, "stalled durable jobs returned to the wait list");
        }
        Ok(recovered)
    }

    /// Atomically move the next waiting job to the active list and start
    /// its lease.
    pub async fn claim(&self) -> Result<Option<QueueJob>, BrokerError> {
        let mut conn = self.connection().await?;
        let job_id: Option<String> = self
            .scripts
            .claim
            .key(self.wait_key())
            .key(self.active_key())
            .key(self.active_since_key())
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await?;
        let Some(job_id) = job_id else {
            return Ok(None);
        };

        let payload: Option<String> = conn.get(self.job_key(&job_id)).await?;
        let Some(payload) = payload else {
            tracing::warn!(job_id = %job_id, "job payload missing, discarding");
            let _: () = redis::pipe()
                .atomic()
                .lrem(self.active_key(), 1, &job_id)
                .zrem(self.active_since_key(), &job_id)
                .query_async(&mut conn)
                .await?;
            return Ok(None);
        };

        match serde_json::from_str::<QueueJob>(&payload) {
            Ok(job) => Ok(Some(job)),
            Err(err) => {
                tracing::error!(job_id = %job_id, error = %err, "job payload unreadable, marking failed");
                let _: () = redis::pipe()
                    .atomic()
                    .lrem(self.active_key(), 1, &job_id)
                    .zrem(self.active_since_key(), &job_id)
                    .lpush(self.failed_key(), &job_id)
                    .ltrim(self.failed_key(), 0, self.retention_end())
                    .query_async(&mut conn)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn reschedule(&self, job: &QueueJob, delay: Duration) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(job)?;
        let due = now_millis().saturating_add(duration_ms(delay));
        let _: () = redis::pipe()
            .atomic()
            .set(self.job_key(&job.job_id), payload)
            .lrem(self.active_key(), 1, &job.job_id)
            .zrem(self.active_since_key(), &job.job_id)
            .zadd(self.delayed_key(), &job.job_id, due)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Record the terminal outcome of `job` and promote the next follow-up
    /// of its conversion, if any. Returns the follow-up's job id.
    async fn complete(&self, job: &QueueJob, delivered: bool) -> Result<Option<String>, BrokerError> {
        let mut conn = self.connection().await?;
        let terminal = if delivered {
            self.completed_key()
        } else {
            self.failed_key()
        };
        let next_key = self.next_key(&job.task.conversion_id);

        for _ in 0..SLOT_RETRIES {
            let head: Option<String> = conn.lindex(&next_key, 0).await?;
            let follow_up = match &head {
                Some(payload) => match serde_json::from_str::<PostbackTask>(payload) {
                    Ok(task) => Some(self.follow_up_job(job, task)),
                    Err(err) => {
                        tracing::error!(
                            conversion_id = %job.task.conversion_id,
                            error = %err,
                            "follow-up payload unreadable, discarding"
                        );
                        let _: () = conn.lrem(&next_key, 1, payload).await?;
                        continue;
                    }
                },
                None => None,
            };

            let (new_id, new_payload) = match &follow_up {
                Some(next) => (next.job_id.clone(), serde_json::to_string(next)?),
                None => (String::new(), String::new()),
            };
            let new_job_key = match &follow_up {
                Some(next) => self.job_key(&next.job_id),
                None => self.job_key(&job.job_id),
            };

            let settled: i64 = self
                .scripts
                .complete
                .key(self.active_key())
                .key(self.active_since_key())
                .key(self.job_key(&job.job_id))
                .key(self.inflight_key(&job.task.conversion_id))
                .key(&terminal)
                .key(&next_key)
                .key(new_job_key)
                .key(self.wait_key())
                .arg(&job.job_id)
                .arg(self.retention_end())
                .arg(head.as_deref().unwrap_or_default())
                .arg(&new_id)
                .arg(new_payload)
                .arg(self.inflight_ttl_ms())
                .invoke_async(&mut conn)
                .await?;

            match settled {
                1 => {
                    metric_inc("postback.enqueue.durable");
                    tracing::debug!(
                        job_id = %job.job_id,
                        follow_up = %new_id,
                        "durable job settled, follow-up queued"
                    );
                    return Ok(Some(new_id));
                }
                0 => return Ok(None),
                _ => continue,
            }
        }

        Err(BrokerError::Command(format!(
            "job {} could not be settled while follow-ups kept arriving",
            job.job_id
        )))
    }

    /// Job for a follow-up of `previous`, never reusing its job id.
    fn follow_up_job(&self, previous: &QueueJob, task: PostbackTask) -> QueueJob {
        let mut at = now_millis();
        if job_id_for(&task.conversion_id, at) == previous.job_id {
            at += 1;
        }
        QueueJob::follow_up(task, self.max_attempts, at)
    }

    /// One consumer pass: recover stalled claims, promote due jobs, then
    /// claim while the pool has room.
    ///
    /// Jobs stay in the broker until the pool can start them right away.
    pub async fn pump(self: &Arc<Self>, pool: &WorkerPool) -> Result<usize, BrokerError> {
        self.recover_stalled(self.stall_timeout).await?;
        self.promote_due().await?;

        let mut claimed = 0;
        while pool.has_capacity() {
            let Some(job) = self.claim().await? else {
                break;
            };
            if let Some(local) = &self.local {
                if !local.hold(&job.task) {
                    tracing::debug!(
                        job_id = %job.job_id,
                        "conversion busy in-process, postponing durable job"
                    );
                    self.reschedule(&job, BUSY_RETRY_DELAY).await?;
                    continue;
                }
            }
            tracing::debug!(job_id = %job.job_id, attempt = job.attempt, "durable job claimed");
            let route: Arc<dyn RetryScheduler> = self.clone();
            pool.submit(job, route);
            claimed += 1;
        }
        Ok(claimed)
    }

    /// Spawn the consumer loop feeding `pool` until `running` turns false.
    ///
    /// The first pass runs immediately, so claims left behind by a previous
    /// process are recovered at startup once their lease has expired.
    pub fn spawn_consumer(
        self: &Arc<Self>,
        pool: WorkerPool,
        running: Arc<AtomicBool>,
        wake: Arc<Notify>,
        poll_interval: Duration,
    ) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                match queue.pump(&pool).await {
                    Ok(claimed) if claimed > 0 => {
                        tokio::task::yield_now().await;
                        continue;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if err.is_connection_error() {
                            queue.broker.invalidate(&err.to_string()).await;
                        } else {
                            tracing::warn!(error = %err, "durable consumer pass failed");
                        }
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = wake.notified() => {}
                }
            }
            tracing::debug!("durable consumer stopped");
        })
    }

    fn release_local(&self, conversion_id: &str) {
        if let Some(local) = &self.local {
            local.release_hold(conversion_id);
        }
    }
}

#[async_trait]
impl RetryScheduler for RedisQueue {
    async fn schedule(&self, job: QueueJob, delay: Duration) -> Result<(), SchedulerError> {
        let conversion_id = job.task.conversion_id.clone();
        match self.reschedule(&job, delay).await {
            Ok(()) => {
                self.release_local(&conversion_id);
                Ok(())
            }
            Err(err) => {
                // The claim lease returns the job to the wait list later.
                tracing::warn!(job_id = %job.job_id, error = %err, "durable retry not scheduled");
                Err(SchedulerError::from(err))
            }
        }
    }

    async fn finish(&self, job: &QueueJob, outcome: &DeliveryOutcome) {
        let delivered = matches!(outcome, DeliveryOutcome::Delivered { .. });
        if let Err(err) = self.complete(job, delivered).await {
            tracing::warn!(job_id = %job.job_id, error = %err, "durable job outcome not recorded");
        }
        self.release_local(&job.task.conversion_id);
    }
}

#[async_trait]
impl ExecutionPath for RedisQueue {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Durable
    }

    async fn accept(&self, task: PostbackTask) -> Result<DeliveryOutcome, SchedulerError> {
        Ok(self.enqueue(task).await?)
    }

    async fn stats(&self) -> Result<QueueStats, SchedulerError> {
        Ok(RedisQueue::stats(self).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::build_task;
    use crate::types::{ConversionRecord, ConversionType};

    fn queue(url: Option<&str>, retention: usize) -> RedisQueue {
        let broker = Arc::new(BrokerConnection::new(
            url.map(str::to_string),
            Duration::from_millis(300),
            Duration::from_secs(60),
        ));
        RedisQueue::new(broker, "pb-test", 5, retention, Duration::from_secs(60))
    }

    #[test]
    fn terminal_lists_keep_retention_entries() {
        assert_eq!(queue(None, 5_000).retention_end(), 4_999);
        assert_eq!(queue(None, 1).retention_end(), 0);
        // Zero is clamped so the most recent id is always kept.
        assert_eq!(queue(None, 0).retention_end(), 0);
    }

    #[test]
    fn keys_live_under_prefix() {
        let q = queue(None, 10);
        assert_eq!(q.inflight_key("c1"), "pb-test:inflight:c1");
        assert_eq!(q.next_key("c1"), "pb-test:next:c1");
        assert_eq!(q.job_key("postback_c1_1"), "pb-test:job:postback_c1_1");
    }

    #[test]
    fn follow_up_never_reuses_previous_job_id() {
        let q = queue(None, 10);
        let task = build_task(&ConversionRecord::new(
            "c1",
            "adv",
            "clk1",
            ConversionType::Purchase,
            "chargeback",
        ));
        let previous = QueueJob::new(task.clone(), 5, now_millis());

        let next = q.follow_up_job(&previous, task);
        assert_ne!(next.job_id, previous.job_id);
        assert_eq!(next.scheduled_delay_ms, 0);
        assert_eq!(next.attempt, 1);
    }

    #[tokio::test]
    async fn enqueue_on_refused_broker_is_a_connection_error() {
        let q = queue(Some("redis://127.0.0.1:1/"), 10);
        let task = build_task(&ConversionRecord::new(
            "c1",
            "adv",
            "clk1",
            ConversionType::Purchase,
            "approved",
        ));

        let err = q.enqueue(task).await.unwrap_err();
        assert!(err.is_connection_error());
    }
}
