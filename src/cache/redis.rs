use crate::cache::run_lock::{LockToken, RunLock};
use crate::error::LockError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Deletes the key only if it still carries our owner token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Run locks shared across processes through Redis (`SET NX EX`).
pub struct RedisRunLock {
    pool: Pool,
    prefix: String,
}

impl RedisRunLock {
    pub async fn new(url: &str, max_connections: usize) -> Result<Self> {
        let mut cfg = Config::from_url(url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(max_connections.max(1)));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .context("Failed to create Redis connection pool")?;

        // Test connection
        let mut conn = pool.get().await.context("Failed to get Redis connection")?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .context("Redis PING failed")?;

        info!("Connected to Redis successfully");

        Ok(Self {
            pool,
            prefix: "dipsignal:lock:".to_string(),
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, LockError> {
        self.pool
            .get()
            .await
            .map_err(|e| LockError::Pool(e.to_string()))
    }
}

#[async_trait]
impl RunLock for RedisRunLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, LockError> {
        let mut conn = self.connection().await?;
        let owner = Uuid::new_v4().to_string();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.redis_key(key))
            .arg(&owner)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        Ok(reply.map(|_| {
            debug!("Acquired lock '{}'", key);
            LockToken {
                key: key.to_string(),
                owner,
            }
        }))
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let mut conn = self.connection().await?;
        let deleted: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.redis_key(&token.key))
            .arg(&token.owner)
            .invoke_async(&mut conn)
            .await?;
        if deleted == 0 {
            debug!("Lock '{}' had already expired or changed owner", token.key);
        }
        Ok(())
    }

    async fn is_held(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let exists: i32 = conn.exists(self.redis_key(key)).await?;
        Ok(exists == 1)
    }
}
