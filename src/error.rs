use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned by `submit_for_delivery` when neither the durable broker nor the
/// autonomous processor accepted the task.
///
/// This is the only error that reaches the upstream caller.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("conversion {conversion_id} could not be accepted: {reason}")]
    Rejected {
        conversion_id: String,
        reason: String,
    },

    #[error("postback engine is shut down")]
    Shutdown,
}

/// Durable broker failures. Never surfaced to the upstream caller; the
/// engine fails over to autonomous processing instead.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Probe or connection-level failure.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The broker answered but the command or payload was rejected.
    #[error("broker command failed: {0}")]
    Command(String),

    #[error("job payload could not be encoded: {0}")]
    Payload(#[from] serde_json::Error),
}

impl BrokerError {
    pub fn is_connection_error(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_))
    }
}

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            BrokerError::Unavailable(err.to_string())
        } else {
            BrokerError::Command(err.to_string())
        }
    }
}

/// Errors raised when a retry cannot be scheduled.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("in-process scheduler is shut down")]
    Closed,
}

/// Errors from an attempt-log sink.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("delivery log channel is full")]
    ChannelFull,

    #[error("delivery log channel is closed")]
    ChannelClosed,

    #[error("delivery log sink failed: {0}")]
    Sink(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Why a single delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    Timeout,
    Network(String),
    /// Response outside the 2xx-3xx range.
    HttpStatus(u16),
    /// The rendered request could not be built (bad URL, bad header).
    InvalidRequest(String),
    /// No profile is configured for the advertiser.
    MissingProfile,
}

impl FailureReason {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureReason::Timeout | FailureReason::Network(_) | FailureReason::HttpStatus(_)
        )
    }

    /// Stable label used for per-error-type breakdowns.
    pub fn kind(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::Network(_) => "network",
            FailureReason::HttpStatus(_) => "http_status",
            FailureReason::InvalidRequest(_) => "invalid_request",
            FailureReason::MissingProfile => "missing_profile",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "request timed out"),
            FailureReason::Network(msg) => write!(f, "network error: {msg}"),
            FailureReason::HttpStatus(code) => write!(f, "tracker responded with HTTP {code}"),
            FailureReason::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            FailureReason::MissingProfile => write!(f, "no postback profile configured"),
        }
    }
}

/// Result of handing a job to the engine or of running one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Tracker accepted the postback.
    Delivered { status_code: u16 },

    /// Attempt failed transiently; `next_attempt` is scheduled after `delay_ms`.
    Retrying {
        reason: FailureReason,
        next_attempt: u32,
        delay_ms: u64,
    },

    /// Terminal failure: attempts exhausted or the failure is not transient.
    Failed {
        reason: FailureReason,
        attempts: u32,
    },

    /// Accepted; the first attempt runs after `delay_ms`.
    Scheduled { delay_ms: u64 },

    /// This exact task is already live or waiting.
    Duplicate,

    /// Another task for the conversion is in flight; this one is kept and
    /// dispatched once that task settles.
    Deferred,
}

/// Errors raised while constructing the engine.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("http client could not be built: {0}")]
    HttpClient(#[from] reqwest::Error),
}
