//! Durable queue tests against a real Redis.
//!
//! Skipped unless `POSTBACK_TEST_REDIS_URL` points at a disposable server.
//! Every test works under its own key prefix and removes it afterwards.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use postback_dispatcher::{
    build_task, BrokerConnection, ConversionRecord, ConversionType, DeliveryLogSink,
    DeliveryOutcome, EngineConfig, ExecutionMode, FailureReason, InMemoryDeliveryLog,
    InMemoryProfileStore, PostbackEngine, PostbackProfile, PostbackTask, QueueJob, RedisQueue,
    RetryScheduler, Submission,
};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn redis_url() -> Option<String> {
    std::env::var("POSTBACK_TEST_REDIS_URL")
        .ok()
        .filter(|url| !url.is_empty())
}

fn unique_prefix(name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("pbtest:{name}:{nanos}")
}

async fn raw_connection(url: &str) -> MultiplexedConnection {
    redis::Client::open(url)
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap()
}

async fn setup(name: &str, retention: usize) -> Option<(RedisQueue, MultiplexedConnection)> {
    let Some(url) = redis_url() else {
        eprintln!("POSTBACK_TEST_REDIS_URL not set, skipping {name}");
        return None;
    };
    let broker = Arc::new(BrokerConnection::new(
        Some(url.clone()),
        Duration::from_secs(2),
        Duration::from_secs(30),
    ));
    let queue = RedisQueue::new(
        broker,
        unique_prefix(name),
        5,
        retention,
        Duration::from_secs(600),
    );
    Some((queue, raw_connection(&url).await))
}

async fn cleanup(conn: &mut MultiplexedConnection, prefix: &str) {
    let keys: Vec<String> = conn.keys(format!("{prefix}:*")).await.unwrap();
    if !keys.is_empty() {
        let _: () = conn.del(keys).await.unwrap();
    }
}

fn task(id: &str, status: &str) -> PostbackTask {
    build_task(&ConversionRecord::new(
        id,
        "adv-1",
        "clk1",
        ConversionType::Purchase,
        status,
    ))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[tokio::test]
async fn enqueue_writes_job_and_respects_initial_delay() {
    let Some((queue, mut conn)) = setup("layout", 10).await else {
        return;
    };
    let p = queue.prefix().to_string();

    let outcome = queue.enqueue(task("c1", "approved")).await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::Scheduled { delay_ms: 0 });

    let waiting: Vec<String> = conn.lrange(format!("{p}:wait"), 0, -1).await.unwrap();
    assert_eq!(waiting.len(), 1);
    assert!(waiting[0].starts_with("postback_c1_"));

    let payload: String = conn.get(format!("{p}:job:{}", waiting[0])).await.unwrap();
    let job: QueueJob = serde_json::from_str(&payload).unwrap();
    assert_eq!(job.attempt, 1);
    assert_eq!(job.max_attempts, 5);
    let live: String = conn.get(format!("{p}:inflight:c1")).await.unwrap();
    assert_eq!(live, waiting[0]);

    let before = now_ms();
    let outcome = queue.enqueue(task("c2", "refunded")).await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::Scheduled { delay_ms: 30_000 });
    let delayed: Vec<(String, u64)> = conn
        .zrange_withscores(format!("{p}:delayed"), 0, -1)
        .await
        .unwrap();
    assert_eq!(delayed.len(), 1);
    assert!(delayed[0].1 >= before + 30_000);

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.waiting, 2);
    assert_eq!(stats.total, 2);

    cleanup(&mut conn, &p).await;
}

#[tokio::test]
async fn status_change_waits_for_live_job_then_runs() {
    let Some((queue, mut conn)) = setup("follow_up", 10).await else {
        return;
    };
    let p = queue.prefix().to_string();

    assert!(matches!(
        queue.enqueue(task("c1", "approved")).await.unwrap(),
        DeliveryOutcome::Scheduled { .. }
    ));
    assert_eq!(
        queue.enqueue(task("c1", "approved")).await.unwrap(),
        DeliveryOutcome::Duplicate
    );
    assert_eq!(
        queue.enqueue(task("c1", "chargeback")).await.unwrap(),
        DeliveryOutcome::Deferred
    );
    assert_eq!(
        queue.enqueue(task("c1", "chargeback")).await.unwrap(),
        DeliveryOutcome::Duplicate
    );
    let queued: u64 = conn.llen(format!("{p}:next:c1")).await.unwrap();
    assert_eq!(queued, 1);

    let approval = queue.claim().await.unwrap().unwrap();
    queue
        .finish(&approval, &DeliveryOutcome::Delivered { status_code: 200 })
        .await;

    let completed: Vec<String> = conn.lrange(format!("{p}:completed"), 0, -1).await.unwrap();
    assert_eq!(completed, vec![approval.job_id.clone()]);
    let queued: u64 = conn.llen(format!("{p}:next:c1")).await.unwrap();
    assert_eq!(queued, 0);

    let chargeback = queue.claim().await.unwrap().unwrap();
    assert_ne!(chargeback.job_id, approval.job_id);
    assert_eq!(chargeback.task.conversion_status.as_str(), "chargeback");
    assert_eq!(chargeback.scheduled_delay_ms, 0);
    let live: String = conn.get(format!("{p}:inflight:c1")).await.unwrap();
    assert_eq!(live, chargeback.job_id);

    queue
        .finish(
            &chargeback,
            &DeliveryOutcome::Failed {
                reason: FailureReason::HttpStatus(500),
                attempts: 5,
            },
        )
        .await;
    let failed: u64 = conn.llen(format!("{p}:failed")).await.unwrap();
    assert_eq!(failed, 1);
    let live: bool = conn.exists(format!("{p}:inflight:c1")).await.unwrap();
    assert!(!live);

    cleanup(&mut conn, &p).await;
}

#[tokio::test]
async fn retry_returns_through_delayed_set() {
    let Some((queue, mut conn)) = setup("retry", 10).await else {
        return;
    };
    let p = queue.prefix().to_string();

    queue.enqueue(task("c1", "approved")).await.unwrap();
    let job = queue.claim().await.unwrap().unwrap();

    queue
        .schedule(job.next_attempt(Duration::ZERO), Duration::ZERO)
        .await
        .unwrap();
    let active: u64 = conn.llen(format!("{p}:active")).await.unwrap();
    let delayed: u64 = conn.zcard(format!("{p}:delayed")).await.unwrap();
    assert_eq!((active, delayed), (0, 1));
    assert!(queue.claim().await.unwrap().is_none());

    assert_eq!(queue.promote_due().await.unwrap(), 1);
    let retried = queue.claim().await.unwrap().unwrap();
    assert_eq!(retried.job_id, job.job_id);
    assert_eq!(retried.attempt, 2);

    cleanup(&mut conn, &p).await;
}

#[tokio::test]
async fn stalled_claim_returns_to_wait_list() {
    let Some((queue, mut conn)) = setup("stalled", 10).await else {
        return;
    };
    let p = queue.prefix().to_string();

    queue.enqueue(task("c1", "approved")).await.unwrap();
    let job = queue.claim().await.unwrap().unwrap();
    let leased: u64 = conn.zcard(format!("{p}:active_since")).await.unwrap();
    assert_eq!(leased, 1);

    // The consumer died mid-attempt; a fresh lease is left alone.
    assert_eq!(queue.recover_stalled(Duration::from_secs(60)).await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(queue.recover_stalled(Duration::ZERO).await.unwrap(), 1);

    let active: u64 = conn.llen(format!("{p}:active")).await.unwrap();
    assert_eq!(active, 0);
    let again = queue.claim().await.unwrap().unwrap();
    assert_eq!(again.job_id, job.job_id);
    assert_eq!(again.attempt, 1);

    cleanup(&mut conn, &p).await;
}

#[tokio::test]
async fn terminal_lists_are_trimmed_to_retention() {
    let Some((queue, mut conn)) = setup("retention", 3).await else {
        return;
    };
    let p = queue.prefix().to_string();

    let mut last = String::new();
    for i in 0..5 {
        queue.enqueue(task(&format!("c{i}"), "approved")).await.unwrap();
        let job = queue.claim().await.unwrap().unwrap();
        queue
            .finish(&job, &DeliveryOutcome::Delivered { status_code: 200 })
            .await;
        last = job.job_id;
    }

    let completed: Vec<String> = conn.lrange(format!("{p}:completed"), 0, -1).await.unwrap();
    assert_eq!(completed.len(), 3);
    assert_eq!(completed[0], last);
    assert_eq!(queue.stats().await.unwrap().completed, 3);

    cleanup(&mut conn, &p).await;
}

#[tokio::test]
async fn engine_delivers_through_durable_queue() {
    let Some(url) = redis_url() else {
        eprintln!("POSTBACK_TEST_REDIS_URL not set, skipping");
        return;
    };
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pb"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let profiles = Arc::new(InMemoryProfileStore::new());
    profiles
        .upsert(PostbackProfile::new("adv-1", format!("{}/pb", server.uri())))
        .await;
    let log = Arc::new(InMemoryDeliveryLog::new());
    let sink: Arc<dyn DeliveryLogSink> = log.clone();
    let prefix = unique_prefix("engine");
    let config = EngineConfig {
        queue_prefix: prefix.clone(),
        poll_interval_ms: 20,
        ..EngineConfig::default()
    }
    .with_redis_url(url.clone());

    let engine = PostbackEngine::start(config, profiles, sink).await.unwrap();
    assert_eq!(engine.mode().await, ExecutionMode::Durable);

    let record = ConversionRecord::new("c1", "adv-1", "clk1", ConversionType::Purchase, "approved");
    assert_eq!(
        engine.submit_for_delivery(&record).await.unwrap(),
        Submission::Accepted {
            mode: ExecutionMode::Durable,
            outcome: DeliveryOutcome::Scheduled { delay_ms: 0 },
        }
    );

    let mut completed = 0;
    for _ in 0..100 {
        let report = engine.queue_stats().await;
        assert_eq!(report.error, None);
        completed = report.stats.completed;
        if completed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(completed, 1);

    engine.shutdown().await;
    assert_eq!(log.for_conversion("c1").await.len(), 1);

    let mut conn = raw_connection(&url).await;
    cleanup(&mut conn, &prefix).await;
}
