//! Redis list queue of trace identifiers
//!
//! Producers `RPUSH` trace ids onto the list, workers `LPOP` them. An empty
//! list pops `nil`.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};

use crate::domain::TraceId;
use crate::infra::{AnalyzerError, QueueSource, Result};

/// Default list key traces are queued under
pub const DEFAULT_QUEUE_KEY: &str = "traces_to_analyze";

/// Redis-backed trace queue
#[derive(Clone)]
pub struct RedisTraceQueue {
    conn: MultiplexedConnection,
    key: String,
}

impl RedisTraceQueue {
    /// Connect to Redis and bind to a list key
    pub async fn connect(redis_url: &str, key: impl Into<String>) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let key = key.into();

        tracing::info!(key = %key, "Connected to trace queue");

        Ok(Self { conn, key })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Enqueue a trace for analysis
    pub async fn push(&self, trace_id: TraceId) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(&self.key, trace_id.to_string())
            .await?;
        Ok(())
    }

    /// Enqueue many traces in one round trip
    pub async fn push_many(&self, trace_ids: &[TraceId]) -> Result<()> {
        if trace_ids.is_empty() {
            return Ok(());
        }
        let tokens: Vec<String> = trace_ids.iter().map(TraceId::to_string).collect();
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(&self.key, tokens).await?;
        Ok(())
    }

    /// Number of queued identifiers
    pub async fn len(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.llen(&self.key).await?;
        Ok(len)
    }
}

#[async_trait]
impl QueueSource for RedisTraceQueue {
    async fn pop_next(&self) -> Result<Option<TraceId>> {
        let mut conn = self.conn.clone();
        let token: Option<String> = conn.lpop(&self.key, None).await?;

        match token {
            Some(token) => TraceId::parse(&token)
                .map(Some)
                .ok_or(AnalyzerError::InvalidTraceId(token)),
            None => Ok(None),
        }
    }
}
