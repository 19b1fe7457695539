//! Redis-backed `KvBackend` — the production coordination point.
//!
//! One `ConnectionManager` shared by clone; it reconnects on its own, so a
//! bounced Redis surfaces as a few categorized errors rather than a wedged
//! process. All commands are built explicitly to keep the dependency surface
//! to plain Redis semantics.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use gpufleet_core::error::FleetError;
use gpufleet_core::ports::{KvBackend, Result};

pub struct RedisBackend {
    manager: ConnectionManager,
}

impl RedisBackend {
    /// Connect and verify reachability with a `PING`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| FleetError::Configuration(format!("invalid redis url: {e}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(map_redis_error)?;
        let backend = Self { manager };
        backend.ping().await?;
        Ok(backend)
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn map_redis_error(e: redis::RedisError) -> FleetError {
    if e.is_timeout() {
        FleetError::Timeout(format!("redis: {}", e.category()))
    } else {
        // Connection, auth, and command failures all mean the coordination
        // point is unusable; the health endpoint flips on this category.
        FleetError::KvUnavailable(format!("redis: {}", e.category()))
    }
}

/// Render a score bound, mapping the sentinel extremes onto Redis infinities.
fn score_arg(value: f64) -> String {
    if value <= f64::MIN {
        "-inf".into()
    } else if value >= f64::MAX {
        "+inf".into()
    } else {
        value.to_string()
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        cmd.query_async::<()>(&mut self.conn())
            .await
            .map_err(map_redis_error)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let reply: Option<String> = cmd
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let found: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(found > 0)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<()>(&mut self.conn())
            .await
            .map_err(map_redis_error)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let removed: i64 = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(removed > 0)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<u64> {
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        redis::cmd("RPOP")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<()>(&mut self.conn())
            .await
            .map_err(map_redis_error)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(removed > 0)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg(score_arg(min)).arg(score_arg(max));
        if let Some(limit) = limit {
            cmd.arg("LIMIT").arg(0).arg(limit as u64);
        }
        cmd.query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(score_arg(min))
            .arg(score_arg(max))
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<(String, f64)>> {
        let popped: Vec<String> = redis::cmd("ZPOPMIN")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        if popped.len() < 2 {
            return Ok(None);
        }
        let score = popped[1]
            .parse::<f64>()
            .map_err(|e| FleetError::Serialization(format!("zpopmin score: {e}")))?;
        Ok(Some((popped[0].clone(), score)))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let ms: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(applied > 0)
    }

    async fn ping(&self) -> Result<()> {
        let _: String = redis::cmd("PING")
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}
