use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

const DEFAULT_RATE: f64 = 100.0;
const DEFAULT_BURST: f64 = 10.0;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-source-address token buckets. Buckets are created full on first
/// observation and refilled lazily on each admission check; the map's
/// per-entry exclusivity serializes refill and deduction for a given key.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<IpAddr, TokenBucket>,
    rate: f64,
    burst: f64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE, DEFAULT_BURST)
    }
}

impl RateLimiter {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            rate,
            burst,
        }
    }

    /// Admit or reject one request from `addr`.
    pub fn allow(&self, addr: IpAddr) -> bool {
        let mut bucket = self.buckets.entry(addr).or_insert_with(|| TokenBucket {
            tokens: self.burst,
            last_refill: Instant::now(),
        });

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            debug!(client = %addr, "rate limit exceeded");
            false
        }
    }

    /// Drop buckets that have not been touched for longer than `idle`.
    pub fn evict_idle(&self, idle: Duration) {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.last_refill.elapsed() < idle);
        let evicted = before - self.buckets.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.buckets.len(), "evicted idle rate-limit buckets");
        }
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }
}
