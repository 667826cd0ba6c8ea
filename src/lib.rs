//! Postback delivery engine for an affiliate tracking backend.
//!
//! When a conversion reaches a finalized status, the engine sends an HTTP
//! notification ("postback") to the advertiser's tracker. URLs are rendered
//! from per-advertiser templates, optionally signed with HMAC-SHA256, and
//! retried with exponential backoff.
//!
//! ## Execution paths
//! - **Durable**: jobs live in Redis and survive restarts.
//! - **Autonomous**: in-process timers, used whenever the broker is
//!   unconfigured or unreachable. Pending retries are lost on restart.
//!
//! Both paths share one bounded worker pool, so the concurrency limit is
//! global across them.
//!
//! ## Guarantees
//! - A submitted conversion is never dropped because the broker is down
//! - At most `max_attempts` attempts per job
//! - Every attempt is logged, best-effort
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering between conversions

mod autonomous;
mod broker;
mod config;
mod delivery_log;
mod engine;
mod error;
mod profile;
mod queue;
mod queue_redis;
mod request;
mod signing;
mod template;
mod trigger;
mod types;
mod worker;

#[cfg(feature = "postgres")]
mod delivery_log_postgres;

pub use autonomous::{AutonomousProcessor, InProcessScheduler};
pub use broker::BrokerConnection;
pub use config::EngineConfig;
pub use delivery_log::{
    truncate_chars, DeliveryAttemptLog, DeliveryLogSink, DeliveryLogger, InMemoryDeliveryLog,
};
pub use engine::{
    test_delivery, PostbackEngine, Submission, TestDeliveryRequest, TestDeliveryResult,
    DEFAULT_TEST_SIGNATURE_TEMPLATE,
};
pub use error::{
    BrokerError, ConfigError, DeliveryOutcome, FailureReason, InitError, LogError,
    SchedulerError, SubmitError,
};
pub use profile::{InMemoryProfileStore, ProfileStore};
pub use queue::{
    backoff_delay, initial_delay, job_id_for, Admission, ExecutionPath, InFlightGuard,
    RetryScheduler, DEFAULT_MAX_ATTEMPTS,
};
pub use queue_redis::{RedisQueue, DEFAULT_STALL_TIMEOUT};
pub use request::{assemble, build_request, PreparedRequest, RequestParts};
pub use signing::{compute_signature, sign_postback, verify_signature, PostbackSignature};
pub use template::{render, status_label, Macros, Template};
pub use trigger::{build_task, should_trigger, task_for};
pub use types::{
    AuthInjection, ConversionRecord, ConversionStatus, ConversionType, ExecutionMode, HttpMethod,
    PostbackProfile, PostbackTask, QueueJob, QueueStats, QueueStatsReport, SignatureConfig,
};
pub use worker::{DeliveryContext, HttpResponse, WorkerPool, DEFAULT_MAX_CONCURRENT};

#[cfg(feature = "postgres")]
pub use delivery_log_postgres::PostgresDeliveryLog;
