use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// Token buckets, one per service, created on first use.
///
/// Each bucket refills at `rate` tokens per second and holds up to twice
/// that. A rate of zero disables limiting.
pub struct ServiceRateLimiter {
    rate: u32,
    burst: u32,
    wait: Duration,
    limiters: RwLock<HashMap<String, Arc<DefaultDirectRateLimiter>>>,
}

impl std::fmt::Debug for ServiceRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRateLimiter")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .field("wait", &self.wait)
            .field("services", &self.limiters.read().len())
            .finish()
    }
}

impl ServiceRateLimiter {
    pub fn new(rate: u32, wait: Duration) -> Self {
        Self::with_burst(rate, rate.saturating_mul(2), wait)
    }

    pub fn with_burst(rate: u32, burst: u32, wait: Duration) -> Self {
        Self {
            rate,
            burst: burst.max(rate),
            wait,
            limiters: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.rate > 0
    }

    /// Wait up to the configured bound for a token of `service`.
    ///
    /// `false` means the bucket stayed empty; the caller reports the check
    /// as rate limited instead of running it.
    pub async fn acquire(&self, service: &str) -> bool {
        let Some(limiter) = self.limiter(service) else {
            return true;
        };
        if limiter.check().is_ok() {
            return true;
        }
        tokio::time::timeout(self.wait, limiter.until_ready())
            .await
            .is_ok()
    }

    /// Take a token without waiting.
    pub fn try_acquire(&self, service: &str) -> bool {
        self.limiter(service).map_or(true, |l| l.check().is_ok())
    }

    pub fn tracked_services(&self) -> usize {
        self.limiters.read().len()
    }

    fn limiter(&self, service: &str) -> Option<Arc<DefaultDirectRateLimiter>> {
        let rate = NonZeroU32::new(self.rate)?;

        if let Some(limiter) = self.limiters.read().get(service) {
            return Some(Arc::clone(limiter));
        }

        let mut limiters = self.limiters.write();
        // Another task may have created it between the two locks
        let limiter = limiters.entry(service.to_string()).or_insert_with(|| {
            let burst = NonZeroU32::new(self.burst).unwrap_or(rate);
            Arc::new(RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)))
        });
        Some(Arc::clone(limiter))
    }
}
