use std::sync::Arc;
use std::time::Duration;

use postback_dispatcher::{
    build_task, AutonomousProcessor, ConversionRecord, ConversionType, DeliveryContext,
    DeliveryLogSink, DeliveryLogger, DeliveryOutcome, InMemoryDeliveryLog, InMemoryProfileStore,
    PostbackProfile, PostbackTask, WorkerPool,
};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn processor(server: &MockServer) -> (AutonomousProcessor, WorkerPool, Arc<InMemoryDeliveryLog>) {
    let profiles = Arc::new(InMemoryProfileStore::new());
    profiles
        .upsert(PostbackProfile::new(
            "adv-1",
            format!("{}/pb?status={{status}}", server.uri()),
        ))
        .await;
    let log = Arc::new(InMemoryDeliveryLog::new());
    let sink: Arc<dyn DeliveryLogSink> = log.clone();

    let ctx = Arc::new(DeliveryContext {
        http_client: reqwest::Client::new(),
        profiles,
        logger: DeliveryLogger::spawn(sink, 64, 1_000),
        body_limit: 1_000,
    });
    let pool = WorkerPool::new(ctx, 4);
    (AutonomousProcessor::new(pool.clone(), 5), pool, log)
}

fn task(status: &str) -> PostbackTask {
    build_task(&ConversionRecord::new(
        "c1",
        "adv-1",
        "clk1",
        ConversionType::Purchase,
        status,
    ))
}

#[tokio::test]
async fn held_conversion_never_runs_twice_in_process() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pb"))
        .and(query_param("status", "rejected"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (processor, pool, log) = processor(&server).await;

    // A durable job for the conversion is running in the pool.
    assert!(processor.hold(&task("approved")));
    assert!(!processor.hold(&task("approved")));

    assert_eq!(
        processor.process(task("approved")).await.unwrap(),
        DeliveryOutcome::Duplicate
    );
    assert_eq!(
        processor.process(task("chargeback")).await.unwrap(),
        DeliveryOutcome::Deferred
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.received_requests().await.unwrap().is_empty());

    processor.release_hold("c1");
    for _ in 0..100 {
        if !log.entries().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    pool.wait_idle().await;

    let entries = log.for_conversion("c1").await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].response_code, Some(200));
    assert!(!processor.is_in_flight("c1"));
}

#[tokio::test]
async fn cancelled_timers_never_reach_the_pool() {
    let server = MockServer::start().await;
    let (processor, pool, log) = processor(&server).await;

    assert_eq!(
        processor.process(task("refunded")).await.unwrap(),
        DeliveryOutcome::Scheduled { delay_ms: 30_000 }
    );
    assert_eq!(processor.delayed_jobs(), 1);

    processor.close();
    assert_eq!(processor.cancel_timers(), 1);
    assert_eq!(processor.delayed_jobs(), 0);

    pool.wait_idle().await;
    assert!(log.entries().await.is_empty());
    assert!(processor.process(task("approved")).await.is_err());
}
