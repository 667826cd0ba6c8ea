use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Engine-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Durable broker location. `None` runs autonomous-only.
    pub redis_url: Option<String>,
    /// Key prefix for every broker key.
    pub queue_prefix: String,
    /// Upper bound on a single reachability probe.
    pub probe_timeout_ms: u64,
    /// Minimum gap between probes after the broker was found unreachable.
    pub reprobe_interval_ms: u64,
    /// Ceiling on concurrently in-flight HTTP deliveries.
    pub max_concurrent: usize,
    pub max_attempts: u32,
    /// How many completed and failed job ids the broker keeps.
    pub retention: usize,
    /// Durable consumer poll period when the queue is empty.
    pub poll_interval_ms: u64,
    /// Age after which a claimed durable job is presumed abandoned and
    /// returned to the wait list. Must exceed every profile timeout.
    pub stall_timeout_ms: u64,
    /// Expiry of the per-conversion in-flight marker in the broker.
    pub inflight_ttl_secs: u64,
    pub log_channel_capacity: usize,
    /// Request and response bodies are cut to this many characters in logs.
    pub log_truncate_len: usize,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            queue_prefix: "postback".to_string(),
            probe_timeout_ms: 2_000,
            reprobe_interval_ms: 30_000,
            max_concurrent: 10,
            max_attempts: 5,
            retention: 5_000,
            poll_interval_ms: 250,
            stall_timeout_ms: 300_000,
            inflight_ttl_secs: 86_400,
            log_channel_capacity: 1_024,
            log_truncate_len: 1_000,
            user_agent: concat!("postback-dispatcher/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `POSTBACK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(url) = lookup("POSTBACK_REDIS_URL").filter(|v| !v.is_empty()) {
            config.redis_url = Some(url);
        }
        if let Some(prefix) = lookup("POSTBACK_QUEUE_PREFIX") {
            config.queue_prefix = prefix;
        }
        if let Some(v) = lookup("POSTBACK_MAX_CONCURRENT") {
            config.max_concurrent = parse("POSTBACK_MAX_CONCURRENT", &v)?;
        }
        if let Some(v) = lookup("POSTBACK_MAX_ATTEMPTS") {
            config.max_attempts = parse("POSTBACK_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("POSTBACK_PROBE_TIMEOUT_MS") {
            config.probe_timeout_ms = parse("POSTBACK_PROBE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("POSTBACK_REPROBE_INTERVAL_MS") {
            config.reprobe_interval_ms = parse("POSTBACK_REPROBE_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("POSTBACK_STALL_TIMEOUT_MS") {
            config.stall_timeout_ms = parse("POSTBACK_STALL_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("POSTBACK_RETENTION") {
            config.retention = parse("POSTBACK_RETENTION", &v)?;
        }
        Ok(config)
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn reprobe_interval(&self) -> Duration {
        Duration::from_millis(self.reprobe_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_defaults() {
        let env: HashMap<&str, &str> = [
            ("POSTBACK_REDIS_URL", "redis://cache:6379"),
            ("POSTBACK_MAX_CONCURRENT", "4"),
            ("POSTBACK_STALL_TIMEOUT_MS", "60000"),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.stall_timeout(), Duration::from_secs(60));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retention, 5_000);
    }

    #[test]
    fn rejects_non_numeric_values() {
        let err = EngineConfig::from_lookup(|k| {
            (k == "POSTBACK_MAX_ATTEMPTS").then(|| "five".to_string())
        })
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "POSTBACK_MAX_ATTEMPTS",
                value: "five".to_string()
            }
        );
    }
}
