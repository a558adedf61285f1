//! # Redis Metrics Sink
//!
//! Publishes counters and gauges into a single Redis hash so dashboards and
//! ops scripts can read them with `HGETALL`. Every update is spawned onto the
//! runtime; callers on the ingestion path never wait for Redis.

use redis::aio::ConnectionManager;
use redis::{Client, Cmd, RedisResult};

use crate::core::circuit_breaker::CircuitState;
use crate::core::metrics::MetricsSink;

/// A [`MetricsSink`] writing into the Redis hash `key`.
#[derive(Clone)]
pub struct RedisMetricsSink {
    conn: ConnectionManager,
    key: String,
}

impl RedisMetricsSink {
    /// Connects to Redis.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    /// * `key` - Name of the hash holding the metrics.
    pub async fn connect(url: &str, key: impl Into<String>) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            key: key.into(),
        })
    }

    /// Round-trips a `PING`.
    pub async fn ping(&self) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    fn spawn(&self, cmd: Cmd) {
        // Guards may drop after the runtime is gone; those updates are skipped.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mut conn = self.conn.clone();
        handle.spawn(async move {
            if let Err(e) = cmd.query_async::<()>(&mut conn).await {
                tracing::debug!(error = %e, "redis metrics update failed");
            }
        });
    }
}

impl MetricsSink for RedisMetricsSink {
    fn incr(&self, counter: &str, by: u64) {
        let mut cmd = redis::cmd("HINCRBY");
        cmd.arg(&self.key).arg(counter).arg(by);
        self.spawn(cmd);
    }

    fn gauge(&self, gauge: &str, value: u64) {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(&self.key).arg(gauge).arg(value);
        self.spawn(cmd);
    }

    fn breaker_state(&self, breaker: &str, state: CircuitState) {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(&self.key)
            .arg(format!("breaker:{}", breaker))
            .arg(state.as_str());
        self.spawn(cmd);
    }
}
