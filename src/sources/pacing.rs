use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::debug;

/// Enforces a minimum spacing between successive external calls.
///
/// The first call passes immediately; each later call waits until `interval`
/// has elapsed since the previous one. A zero interval disables pacing.
pub struct Pacer {
    label: &'static str,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl Pacer {
    pub fn new(label: &'static str, interval: Duration) -> Self {
        let limiter = Quota::with_period(interval)
            .map(|quota| RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN)));
        Self { label, limiter }
    }

    pub fn disabled(label: &'static str) -> Self {
        Self {
            label,
            limiter: None,
        }
    }

    pub async fn wait(&self) {
        if let Some(limiter) = &self.limiter {
            if limiter.check().is_err() {
                debug!("{}: pacing next call", self.label);
                limiter.until_ready().await;
            }
        }
    }
}
