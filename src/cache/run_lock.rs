use crate::error::LockError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Key prefix for job-level locks, e.g. `job:daily_pipeline`.
pub fn job_lock_key(job: &str) -> String {
    format!("job:{}", job)
}

/// Lock shared by the daily and backfill summarizers.
pub const NEWS_SUMMARIES_LOCK: &str = "news_summaries";

/// Proof of ownership, required to release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub owner: String,
}

/// Named, expiring mutual-exclusion locks.
#[async_trait]
pub trait RunLock: Send + Sync {
    /// Returns `None` when someone else holds the lock.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, LockError>;

    /// Releasing a lock that expired or changed owner is a no-op.
    async fn release(&self, token: &LockToken) -> Result<(), LockError>;

    async fn is_held(&self, key: &str) -> Result<bool, LockError>;
}

pub type SharedRunLock = Arc<dyn RunLock>;

/// Polls until the lock is acquired or `wait` elapses.
pub async fn acquire_with_wait(
    lock: &dyn RunLock,
    key: &str,
    ttl: Duration,
    wait: Duration,
    poll: Duration,
) -> Result<LockToken, LockError> {
    let deadline = Instant::now() + wait;
    loop {
        if let Some(token) = lock.try_acquire(key, ttl).await? {
            return Ok(token);
        }
        if Instant::now() >= deadline {
            return Err(LockError::WaitExpired(key.to_string(), wait));
        }
        debug!("Lock '{}' busy, polling again in {:?}", key, poll);
        tokio::time::sleep(poll).await;
    }
}

/// Waits (bounded) until nobody holds `key`. Returns false on timeout.
pub async fn wait_until_free(
    lock: &dyn RunLock,
    key: &str,
    wait: Duration,
    poll: Duration,
) -> Result<bool, LockError> {
    let deadline = Instant::now() + wait;
    while lock.is_held(key).await? {
        if Instant::now() >= deadline {
            return Ok(false);
        }
        info!("Waiting for '{}' to be released", key);
        tokio::time::sleep(poll).await;
    }
    Ok(true)
}

/// Process-local locks, used when no Redis URL is configured.
#[derive(Default)]
pub struct LocalRunLock {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl LocalRunLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunLock for LocalRunLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, LockError> {
        let mut held = self.held.lock();
        let now = Instant::now();
        if let Some((_, expires)) = held.get(key) {
            if *expires > now {
                return Ok(None);
            }
        }
        let owner = Uuid::new_v4().to_string();
        held.insert(key.to_string(), (owner.clone(), now + ttl));
        Ok(Some(LockToken {
            key: key.to_string(),
            owner,
        }))
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let mut held = self.held.lock();
        if held.get(&token.key).map(|(owner, _)| owner == &token.owner) == Some(true) {
            held.remove(&token.key);
        }
        Ok(())
    }

    async fn is_held(&self, key: &str) -> Result<bool, LockError> {
        Ok(self
            .held
            .lock()
            .get(key)
            .map(|(_, expires)| *expires > Instant::now())
            .unwrap_or(false))
    }
}
