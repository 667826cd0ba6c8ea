use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::BrokerError;
use crate::types::ExecutionMode;

#[derive(Default)]
struct BrokerState {
    connection: Option<MultiplexedConnection>,
    last_failure: Option<Instant>,
    last_error: Option<String>,
}

/// Owner of the single shared connection to the durable broker.
///
/// The first caller probes the broker within `probe_timeout`. A successful
/// probe is cached until [`invalidate`](Self::invalidate) is called; a
/// failed one routes callers to autonomous mode and is not retried before
/// `reprobe_interval` has passed. Probes are serialized, so a flapping
/// broker never has more than one connection attempt open.
pub struct BrokerConnection {
    url: Option<String>,
    probe_timeout: Duration,
    reprobe_interval: Duration,
    state: Mutex<BrokerState>,
}

impl BrokerConnection {
    pub fn new(url: Option<String>, probe_timeout: Duration, reprobe_interval: Duration) -> Self {
        Self {
            url,
            probe_timeout,
            reprobe_interval,
            state: Mutex::new(BrokerState::default()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    /// The shared connection, probing first if none is cached.
    pub async fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        let mut state = self.state.lock().await;
        if let Some(conn) = &state.connection {
            return Ok(conn.clone());
        }

        let Some(url) = self.url.as_deref() else {
            return Err(BrokerError::Unavailable("no broker configured".to_string()));
        };

        if let Some(failed_at) = state.last_failure {
            if failed_at.elapsed() < self.reprobe_interval {
                let reason = state.last_error.clone().unwrap_or_default();
                return Err(BrokerError::Unavailable(reason));
            }
        }

        match self.probe(url).await {
            Ok(conn) => {
                tracing::info!(mode = %ExecutionMode::Durable, "durable broker reachable");
                state.connection = Some(conn.clone());
                state.last_failure = None;
                state.last_error = None;
                Ok(conn)
            }
            Err(err) => {
                tracing::warn!(
                    mode = %ExecutionMode::Autonomous,
                    error = %err,
                    "durable broker probe failed, using autonomous processing"
                );
                state.last_failure = Some(Instant::now());
                state.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    async fn probe(&self, url: &str) -> Result<MultiplexedConnection, BrokerError> {
        let client =
            redis::Client::open(url).map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let connect = async {
            let mut conn = client
                .get_multiplexed_async_connection_with_timeouts(
                    self.probe_timeout,
                    self.probe_timeout,
                )
                .await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, redis::RedisError>(conn)
        };

        // On timeout the connect future is dropped, which closes its socket.
        match tokio::time::timeout(self.probe_timeout, connect).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(err)) => Err(BrokerError::Unavailable(err.to_string())),
            Err(_) => Err(BrokerError::Unavailable(format!(
                "probe timed out after {}ms",
                self.probe_timeout.as_millis()
            ))),
        }
    }

    /// Drop the cached connection after a connection-level failure.
    ///
    /// A no-op when no connection is cached, so repeated failures while the
    /// broker is down do not push the next probe further out.
    pub async fn invalidate(&self, reason: &str) {
        let mut state = self.state.lock().await;
        if state.connection.take().is_some() {
            tracing::warn!(error = reason, "durable broker connection lost, failing over");
            state.last_failure = Some(Instant::now());
            state.last_error = Some(reason.to_string());
        }
    }

    /// Current routing decision. Probes if due.
    pub async fn mode(&self) -> ExecutionMode {
        match self.connection().await {
            Ok(_) => ExecutionMode::Durable,
            Err(_) => ExecutionMode::Autonomous,
        }
    }

    /// Whether a connection is cached, without probing.
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connection.is_some()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }
}
