//! Redis-backed rate limit counters for multi-process deployments.
//!
//! Uses INCR with a TTL set on first write so counters expire on their own.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use super::CounterBackend;

pub struct RedisCounters {
    conn: ConnectionManager,
}

impl RedisCounters {
    pub async fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CounterBackend for RedisCounters {
    async fn get(&self, key: &str) -> u64 {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<u64>>(key).await {
            Ok(value) => value.unwrap_or(0),
            Err(e) => {
                // Fail open: an unreachable counter store must not take the
                // API down with it.
                warn!(error = %e, "rate limit counter read failed");
                0
            }
        }
    }

    async fn incr(&self, key: &str, ttl: Duration) -> u64 {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(
            r#"
            local value = redis.call('INCR', KEYS[1])
            if value == 1 then
                redis.call('EXPIRE', KEYS[1], ARGV[1])
            end
            return value
        "#,
        );
        let result: redis::RedisResult<u64> = script
            .key(key)
            .arg(ttl.as_secs())
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "rate limit counter increment failed");
                0
            }
        }
    }
}
