//! # Per-Gateway Rate Limiting
//!
//! Token buckets keyed by gateway id. Streams call [`RateLimiter::wait`] and
//! sleep for the returned delay, which applies backpressure to a busy
//! gateway. One-shot requests (activations) call [`RateLimiter::limit`] and are
//! refused when the bucket is empty.
//!
//! A rate of zero disables the limiter.

use crate::gateway::GatewayId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    updated: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    rate_per_sec: f64,
    burst: f64,
    buckets: Mutex<HashMap<GatewayId, Bucket>>,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_per_sec: rate_per_sec.max(0.0),
            burst: f64::from(burst.max(1)),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0.0, 1)
    }

    pub fn is_enabled(&self) -> bool {
        self.rate_per_sec > 0.0
    }

    /// Refill the bucket for `id` and apply `f` to it
    fn with_bucket<R>(&self, id: &GatewayId, f: impl FnOnce(&mut Bucket) -> R) -> R {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(id.clone()).or_insert(Bucket {
            tokens: self.burst,
            updated: now,
        });
        let elapsed = now.duration_since(bucket.updated).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.updated = now;
        f(bucket)
    }

    /// Reserve a token, returning how long to wait before using it
    pub fn wait(&self, id: &GatewayId) -> Duration {
        if !self.is_enabled() {
            return Duration::ZERO;
        }
        let rate = self.rate_per_sec;
        self.with_bucket(id, |bucket| {
            bucket.tokens -= 1.0;
            if bucket.tokens >= 0.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(-bucket.tokens / rate)
            }
        })
    }

    /// True when `id` is over its limit; a token is taken only when it is not
    pub fn limit(&self, id: &GatewayId) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.with_bucket(id, |bucket| {
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                false
            } else {
                true
            }
        })
    }

    /// Drop the bucket of a gateway that went away
    pub fn forget(&self, id: &GatewayId) {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
    }
}
