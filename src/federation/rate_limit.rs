//! Rate limiting for inbound HTTP.
//!
//! Per-IP token bucket, swept periodically so idle entries don't accumulate
//! forever. Grounded on the teacher's `RateLimiter` shape (`HashMap` behind
//! an `RwLock`, `prune_old`/`stats`/`extract_domain` kept) with the counting
//! logic replaced by a token bucket to match the burst semantics this core
//! needs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::AppError;

/// The map is swept when it exceeds this many entries.
const MAX_ENTRIES: usize = 10_000;
/// Otherwise swept every 5 minutes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-key token bucket rate limiter.
pub struct RateLimiter {
    buckets: Arc<RwLock<HashMap<String, Bucket>>>,
    rate_per_sec: f64,
    burst: f64,
    last_sweep: Arc<RwLock<Instant>>,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            rate_per_sec,
            burst,
            last_sweep: Arc::new(RwLock::new(Instant::now())),
        }
    }

    /// Global limiter: 10 req/s, burst 20.
    pub fn global() -> Self {
        Self::new(10.0, 20.0)
    }

    /// ActivityPub endpoints: 5 req/s, burst 10.
    pub fn activitypub() -> Self {
        Self::new(5.0, 10.0)
    }

    /// Consume one token for `key`. `Err(RateLimited)` if none available.
    pub async fn check_and_increment(&self, key: &str) -> Result<(), AppError> {
        self.maybe_sweep().await;

        let mut buckets = self.buckets.write().await;
        let now = Instant::now();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(AppError::RateLimited)
        }
    }

    async fn maybe_sweep(&self) {
        let needs_sweep = {
            let buckets = self.buckets.read().await;
            let last_sweep = *self.last_sweep.read().await;
            buckets.len() > MAX_ENTRIES || last_sweep.elapsed() >= SWEEP_INTERVAL
        };
        if !needs_sweep {
            return;
        }

        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_, b| b.tokens < self.burst || b.last_refill.elapsed() < SWEEP_INTERVAL);
        let removed = before - buckets.len();
        if removed > 0 {
            tracing::debug!(removed, "pruned idle rate limit entries");
        }
        *self.last_sweep.write().await = Instant::now();
    }

    pub async fn stats(&self) -> RateLimitStats {
        let buckets = self.buckets.read().await;
        RateLimitStats {
            total_entries: buckets.len(),
            rate_per_sec: self.rate_per_sec,
            burst: self.burst,
        }
    }

    #[cfg(test)]
    pub async fn reset(&self, key: &str) {
        self.buckets.write().await.remove(key);
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitStats {
    pub total_entries: usize,
    pub rate_per_sec: f64,
    pub burst: f64,
}

/// Extract the host:port authority from an actor URI, used as the
/// rate-limit key fallback when no peer IP is available.
pub fn extract_domain(uri: &str) -> String {
    uri.split("://")
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or(uri)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_burst_then_rejects() {
        let limiter = RateLimiter::new(1.0, 3.0);
        assert!(limiter.check_and_increment("1.2.3.4").await.is_ok());
        assert!(limiter.check_and_increment("1.2.3.4").await.is_ok());
        assert!(limiter.check_and_increment("1.2.3.4").await.is_ok());
        assert!(limiter.check_and_increment("1.2.3.4").await.is_err());
    }

    #[tokio::test]
    async fn refills_over_time() {
        let limiter = RateLimiter::new(100.0, 1.0);
        assert!(limiter.check_and_increment("1.2.3.4").await.is_ok());
        assert!(limiter.check_and_increment("1.2.3.4").await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(limiter.check_and_increment("1.2.3.4").await.is_ok());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(1.0, 1.0);
        assert!(limiter.check_and_increment("a").await.is_ok());
        assert!(limiter.check_and_increment("b").await.is_ok());
        assert!(limiter.check_and_increment("a").await.is_err());
        assert!(limiter.check_and_increment("b").await.is_err());
    }

    #[test]
    fn extract_domain_strips_scheme_and_path() {
        assert_eq!(extract_domain("https://example.com/users/alice"), "example.com");
        assert_eq!(extract_domain("invalid"), "invalid");
    }
}
