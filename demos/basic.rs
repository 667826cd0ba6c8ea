use std::sync::Arc;

use postback_dispatcher::{
    ConversionRecord, ConversionType, EngineConfig, InMemoryDeliveryLog, InMemoryProfileStore,
    PostbackEngine, PostbackProfile,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = EngineConfig::from_env()?;

    let profiles = Arc::new(InMemoryProfileStore::new());
    profiles
        .upsert(
            PostbackProfile::new(
                "adv_42",
                "https://tracker.example.com/pb?subid={click_id}&status={status}&payout={payout}",
            )
            .with_signature("supersecret", "{click_id}:{txid}:{status}"),
        )
        .await;

    let log = Arc::new(InMemoryDeliveryLog::new());
    let engine = PostbackEngine::start(config, profiles, log.clone()).await?;

    let conversion = ConversionRecord::new(
        "conv_123",
        "adv_42",
        "clk_abc",
        ConversionType::Purchase,
        "approved",
    )
    .with_external_tx_id("order_9")
    .with_revenue("19.90", "EUR");

    let submission = engine.submit_for_delivery(&conversion).await?;
    println!("submission: {submission:?}");
    println!("stats: {:?}", engine.queue_stats().await);

    engine.shutdown().await;
    for entry in log.entries().await {
        println!("attempt {} -> {:?} {:?}", entry.attempt, entry.response_code, entry.error);
    }
    Ok(())
}
