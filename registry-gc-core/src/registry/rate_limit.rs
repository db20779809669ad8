use governor::{Quota, RateLimiter};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::settings::RateLimitSettings;

/// Token bucket shared across every caller of the registry client: the
/// layer graph's inspection workers and the orchestrator's deletion workers all acquire from the same
/// bucket, so one rate-limited client prevents a thundering herd regardless
/// of how many pools are calling it concurrently.
#[derive(Clone)]
pub struct SharedRateLimiter {
    inner: Option<Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
}

impl SharedRateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        if !settings.enabled {
            return Self { inner: None };
        }
        let rate = NonZeroU32::new(settings.requests_per_sec.max(1)).unwrap();
        let burst = NonZeroU32::new(settings.burst.max(1)).unwrap();
        let quota = Quota::per_second(rate).allow_burst(burst);
        Self {
            inner: Some(Arc::new(RateLimiter::direct(quota))),
        }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Acquire one token, sleeping exactly as long as needed for the bucket
    /// to refill one slot. A no-op when rate limiting is disabled.
    pub async fn acquire(&self) {
        let Some(limiter) = &self.inner else {
            return;
        };
        limiter.until_ready().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_limiter_never_blocks() {
        let limiter = SharedRateLimiter::disabled();
        let start = std::time::Instant::now();
        for _ in 0..50 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < std::time::Duration::from_millis(50));
    }

    #[tokio::test]
    async fn enabled_limiter_allows_burst_without_delay() {
        let settings = RateLimitSettings {
            enabled: true,
            requests_per_sec: 5,
            burst: 5,
        };
        let limiter = SharedRateLimiter::new(&settings);
        let start = std::time::Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < std::time::Duration::from_millis(200));
    }
}
