use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorRateLimiter};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tracing::debug;

/// Rate limiting configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Time to regain one token
    pub refill_period: Duration,
    /// Burst capacity
    pub burst: u32,
    /// Peers silent for this long are forgotten
    pub idle_timeout: Duration,
    /// Minimum time between two eviction passes
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            refill_period: Duration::from_secs(1),
            burst: 3,
            idle_timeout: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Rate limiting errors
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

struct Visitor {
    limiter: DefaultDirectRateLimiter,
    last_seen: Instant,
}

struct Visitors {
    peers: HashMap<String, Visitor>,
    last_cleanup: Instant,
}

/// Per-peer token buckets behind one lock.
pub struct RateLimiter {
    quota: Quota,
    idle_timeout: Duration,
    cleanup_interval: Duration,
    visitors: Mutex<Visitors>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self, RateLimitError> {
        let burst = NonZeroU32::new(config.burst)
            .ok_or_else(|| RateLimitError::ConfigError("burst must be positive".into()))?;
        let quota = Quota::with_period(config.refill_period)
            .ok_or_else(|| RateLimitError::ConfigError("refill period must be positive".into()))?
            .allow_burst(burst);

        Ok(Self {
            quota,
            idle_timeout: config.idle_timeout,
            cleanup_interval: config.cleanup_interval,
            visitors: Mutex::new(Visitors {
                peers: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        })
    }

    /// Take one token from `peer`'s bucket. Returns false when it is empty.
    pub fn allow(&self, peer: &str) -> bool {
        self.allow_at(peer, Instant::now())
    }

    fn allow_at(&self, peer: &str, now: Instant) -> bool {
        let mut visitors = self.visitors.lock();

        if now.saturating_duration_since(visitors.last_cleanup) >= self.cleanup_interval {
            let idle_timeout = self.idle_timeout;
            let before = visitors.peers.len();
            visitors
                .peers
                .retain(|_, visitor| now.saturating_duration_since(visitor.last_seen) < idle_timeout);
            visitors.last_cleanup = now;
            debug!(evicted = before - visitors.peers.len(), "Evicted idle peers");
        }

        let quota = self.quota;
        let visitor = visitors
            .peers
            .entry(peer.to_string())
            .or_insert_with(|| Visitor {
                limiter: GovernorRateLimiter::direct(quota),
                last_seen: now,
            });
        visitor.last_seen = now;
        visitor.limiter.check().is_ok()
    }

    /// Number of peers currently tracked.
    pub fn tracked_peers(&self) -> usize {
        self.visitors.lock().peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[test]
    fn test_rate_limiter_creation() {
        assert!(RateLimiter::new(RateLimitConfig::default()).is_ok());
        let zero_burst = RateLimitConfig {
            burst: 0,
            ..Default::default()
        };
        assert!(RateLimiter::new(zero_burst).is_err());
        let zero_period = RateLimitConfig {
            refill_period: Duration::ZERO,
            ..Default::default()
        };
        assert!(RateLimiter::new(zero_period).is_err());
    }

    #[test]
    fn test_burst_then_denied() {
        let limiter = RateLimiter::new(RateLimitConfig::default()).unwrap();

        for _ in 0..3 {
            assert!(limiter.allow("10.0.0.1"));
        }
        assert!(!limiter.allow("10.0.0.1"));
    }

    #[test]
    fn test_different_peers() {
        let config = RateLimitConfig {
            burst: 1,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config).unwrap();

        assert!(limiter.allow("10.0.0.1"));
        assert!(limiter.allow("10.0.0.2"));
        assert!(!limiter.allow("10.0.0.1"));
        assert!(!limiter.allow("10.0.0.2"));
        assert_eq!(limiter.tracked_peers(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_recovery() {
        let config = RateLimitConfig {
            refill_period: Duration::from_millis(100),
            burst: 1,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config).unwrap();

        assert!(limiter.allow("peer"));
        assert!(!limiter.allow("peer"));

        sleep(Duration::from_millis(150)).await;

        assert!(limiter.allow("peer"));
        assert!(!limiter.allow("peer"));
    }

    #[test]
    fn test_idle_peers_are_evicted() {
        let config = RateLimitConfig {
            idle_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(30),
            ..Default::default()
        };
        let limiter = RateLimiter::new(config).unwrap();
        let start = Instant::now();

        for i in 0..100 {
            limiter.allow_at(&format!("10.0.0.{i}"), start);
        }
        assert_eq!(limiter.tracked_peers(), 100);

        // Too early for a cleanup pass.
        limiter.allow_at("fresh", start + Duration::from_secs(10));
        assert_eq!(limiter.tracked_peers(), 101);

        // Cleanup runs, only "fresh" and the caller are recent enough.
        limiter.allow_at("caller", start + Duration::from_secs(65));
        assert_eq!(limiter.tracked_peers(), 2);
    }
}
