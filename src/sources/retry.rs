use crate::error::SourceError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Bounded exponential backoff for quota-constrained APIs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Adds up to one second of random delay per retry.
    pub jitter: bool,
}

impl BackoffPolicy {
    /// CoinGecko's free tier: 5 attempts starting at 5 seconds.
    pub fn coingecko() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(80),
            jitter: false,
        }
    }

    /// Yahoo: 3 attempts at 1s, 2s (+ jitter).
    pub fn yahoo() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }

    pub fn default_http() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }

    /// Single attempt, used by tests and one-shot tooling.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let mut delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter {
            let extra: f64 = rand::thread_rng().gen_range(0.0..1.0);
            delay += Duration::from_secs_f64(extra);
        }
        delay
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::default_http()
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted. Rate-limit responses honour a longer
/// `Retry-After` when the server sends one.
pub async fn retry_with_backoff<T, F, Fut>(
    label: &str,
    policy: &BackoffPolicy,
    mut op: F,
) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let mut delay = policy.delay_for(attempt);
                if let SourceError::RateLimited {
                    retry_after: Some(after),
                    ..
                } = &e
                {
                    delay = delay.max(*after);
                }
                warn!(
                    "{}: attempt {}/{} failed ({}), retrying in {:.1?}",
                    label,
                    attempt + 1,
                    attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!("{}: giving up after {} attempt(s): {}", label, attempt + 1, e);
                return Err(e);
            }
        }
    }
}
