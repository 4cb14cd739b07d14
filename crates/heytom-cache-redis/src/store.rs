//! Redis implementation of the far-tier contract.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::task::JoinHandle;

use heytom_cache::{CacheConfig, CacheError, FarStore, MessageHandler, Result, Subscription};

/// Release: delete the key only while it still holds the caller's token.
static COMPARE_AND_DELETE: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end",
    )
});

/// Extend: reset the TTL only while the key holds the caller's token.
static COMPARE_AND_EXPIRE: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end",
    )
});

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

fn map_redis_err(e: redis::RedisError) -> CacheError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped()
    {
        CacheError::connection(e.to_string())
    } else {
        CacheError::backend(e.to_string())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis().max(1)).min(u128::from(u64::MAX)) as u64
}

/// Builder for [`RedisFarStore`].
pub struct RedisFarStoreBuilder {
    url: String,
    pool_size: usize,
}

impl RedisFarStoreBuilder {
    /// Start a builder for the given Redis URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: 16,
        }
    }

    /// Maximum number of pooled connections.
    #[must_use]
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Create the store. Connections are established lazily on first use.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Configuration` when the URL does not parse.
    pub fn build(self) -> Result<RedisFarStore> {
        let mut cfg = PoolConfig::from_url(&self.url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(self.pool_size));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::configuration(format!("invalid redis pool config: {e}")))?;
        Ok(RedisFarStore {
            pool,
            url: self.url,
            closed: AtomicBool::new(false),
        })
    }
}

/// Far store backed by a Redis-compatible server.
///
/// All cache operations share one multiplexed connection pool; each
/// subscription runs a dedicated client connection on a background task
/// that reconnects automatically.
pub struct RedisFarStore {
    pool: Pool,
    url: String,
    closed: AtomicBool,
}

impl RedisFarStore {
    /// Create a store from the cache configuration's `far_url`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Configuration` when the URL does not parse.
    pub fn connect(config: &CacheConfig) -> Result<Self> {
        RedisFarStoreBuilder::new(&config.far_url).build()
    }

    /// Start a builder.
    #[must_use]
    pub fn builder(url: impl Into<String>) -> RedisFarStoreBuilder {
        RedisFarStoreBuilder::new(url)
    }

    /// The underlying connection pool, for health checks and tests.
    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::connection("redis far store is closed"));
        }
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::connection(format!("failed to get redis connection: {e}")))
    }
}

#[async_trait]
impl FarStore for RedisFarStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(map_redis_err)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => {
                let _: () = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut *conn)
                    .await
                    .map_err(map_redis_err)?;
            }
            None => {
                let _: () = conn.set(key, value).await.map_err(map_redis_err)?;
            }
        }
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(keys).await.map_err(map_redis_err)?;
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let updated: bool = conn
            .pexpire(key, ttl_millis(ttl) as i64)
            .await
            .map_err(map_redis_err)?;
        Ok(updated)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.hset(key, field, value).await.map_err(map_redis_err)?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = conn.hget(key, field).await.map_err(map_redis_err)?;
        Ok(value)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let mut conn = self.conn().await?;
        let all: HashMap<String, Vec<u8>> = conn.hgetall(key).await.map_err(map_redis_err)?;
        Ok(all)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.hdel(key, field).await.map_err(map_redis_err)?;
        Ok(removed > 0)
    }

    async fn list_push(&self, key: &str, value: &[u8]) -> Result<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.rpush(key, value).await.map_err(map_redis_err)?;
        Ok(len)
    }

    async fn list_pop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let popped: Option<Vec<u8>> = conn.lpop(key, None).await.map_err(map_redis_err)?;
        Ok(popped)
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.llen(key).await.map_err(map_redis_err)?;
        Ok(len)
    }

    async fn set_add(&self, key: &str, member: &[u8]) -> Result<bool> {
        let mut conn = self.conn().await?;
        let added: u64 = conn.sadd(key, member).await.map_err(map_redis_err)?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &[u8]) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.srem(key, member).await.map_err(map_redis_err)?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let members: Vec<Vec<u8>> = conn.smembers(key).await.map_err(map_redis_err)?;
        Ok(members)
    }

    async fn sorted_add(&self, key: &str, member: &[u8], score: f64) -> Result<bool> {
        let mut conn = self.conn().await?;
        let added: u64 = conn.zadd(key, member, score).await.map_err(map_redis_err)?;
        Ok(added > 0)
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let members: Vec<Vec<u8>> = conn
            .zrangebyscore(key, min, max)
            .await
            .map_err(map_redis_err)?;
        Ok(members)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64> {
        let mut conn = self.conn().await?;
        let receivers: u64 = conn.publish(channel, payload).await.map_err(map_redis_err)?;
        Ok(receivers)
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::connection("redis far store is closed"));
        }
        let url = self.url.clone();
        let channel = channel.to_string();
        let active = Arc::new(AtomicBool::new(true));
        let task_active = Arc::clone(&active);

        // SUBSCRIBE needs a dedicated connection; pooled multiplexed
        // connections cannot enter subscriber mode.
        let handle = tokio::spawn(async move {
            loop {
                match run_subscription(&url, &channel, &handler).await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::error!(
                            channel = %channel,
                            error = %e,
                            "redis subscription lost; reconnecting in {}s",
                            RECONNECT_DELAY.as_secs()
                        );
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
            task_active.store(false, Ordering::Release);
        });

        Ok(Box::new(RedisSubscription {
            handle: Some(handle),
            active,
        }))
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut *conn)
            .await
            .map_err(map_redis_err)?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.conn().await?;
        let affected: i64 = COMPARE_AND_DELETE
            .key(key)
            .arg(expected)
            .invoke_async(&mut *conn)
            .await
            .map_err(map_redis_err)?;
        Ok(affected > 0)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let affected: i64 = COMPARE_AND_EXPIRE
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut *conn)
            .await
            .map_err(map_redis_err)?;
        Ok(affected > 0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.pool.close();
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

impl std::fmt::Debug for RedisFarStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisFarStore")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// One connect-subscribe-consume pass; the caller loops and backs off.
async fn run_subscription(url: &str, channel: &str, handler: &MessageHandler) -> Result<()> {
    let client = redis::Client::open(url)
        .map_err(|e| CacheError::connection(format!("failed to create redis client: {e}")))?;

    let mut pubsub = client.get_async_pubsub().await.map_err(map_redis_err)?;
    pubsub.subscribe(channel).await.map_err(map_redis_err)?;
    tracing::info!(channel = %channel, "subscribed to redis channel");

    let mut stream = pubsub.on_message();
    loop {
        match stream.next().await {
            Some(msg) => match msg.get_payload::<Vec<u8>>() {
                Ok(payload) => handler(payload),
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "failed to read message payload");
                }
            },
            None => {
                return Err(CacheError::connection("redis pub/sub stream ended"));
            }
        }
    }
}

struct RedisSubscription {
    handle: Option<JoinHandle<()>>,
    active: Arc<AtomicBool>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn close(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.active.store(false, Ordering::Release);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for RedisSubscription {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_rejects_bad_url() {
        assert!(RedisFarStoreBuilder::new("not a url").build().is_err());
    }

    #[test]
    fn test_ttl_millis_floor() {
        assert_eq!(ttl_millis(Duration::from_nanos(1)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
