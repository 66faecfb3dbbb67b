//! Token-bucket rate limiting per endpoint class
//!
//! One bucket per endpoint class, each with its own sustained rate and burst
//! allowance. Tokens are stored in milli-token fixed point so fractional
//! refill rates accumulate without drift. Callers either `try_acquire`
//! (non-blocking) or `acquire` (awaits until a token is available).

use crate::config::RateLimiterConfig;
use crate::exchange::api::EndpointClass;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::warn;

const TOKEN_SCALE: u64 = 1_000;

struct Bucket {
    rate_per_s: f64,
    burst: u64,
    /// Milli-tokens available.
    tokens: AtomicU64,
    last_refill: Mutex<Instant>,
    rejected: AtomicU64,
}

impl Bucket {
    fn new(rate_per_s: f64, burst: u64) -> Self {
        Self {
            rate_per_s,
            burst,
            tokens: AtomicU64::new(burst * TOKEN_SCALE),
            last_refill: Mutex::new(Instant::now()),
            rejected: AtomicU64::new(0),
        }
    }

    fn refill(&self) {
        let mut last = self.last_refill.lock();
        let elapsed = last.elapsed();
        let add = (self.rate_per_s * elapsed.as_secs_f64() * TOKEN_SCALE as f64) as u64;
        if add == 0 {
            return;
        }
        let cap = self.burst * TOKEN_SCALE;
        let current = self.tokens.load(Ordering::Acquire);
        self.tokens.store((current + add).min(cap), Ordering::Release);
        *last = Instant::now();
    }

    fn try_take(&self) -> bool {
        self.refill();
        let mut current = self.tokens.load(Ordering::Acquire);
        loop {
            if current < TOKEN_SCALE {
                let rejected = self.rejected.fetch_add(1, Ordering::Relaxed) + 1;
                if rejected % 100 == 1 {
                    warn!(rejected, "rate limiter exhausted");
                }
                return false;
            }
            match self.tokens.compare_exchange_weak(
                current,
                current - TOKEN_SCALE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

pub struct RateLimiter {
    buckets: HashMap<EndpointClass, Bucket>,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimiterConfig) -> Self {
        let mut buckets = HashMap::new();
        for class in [EndpointClass::Orders, EndpointClass::Queries, EndpointClass::Stream] {
            let (rate, burst) = cfg
                .endpoint_overrides
                .get(class.as_str())
                .map(|o| (o.capacity_per_s, o.burst))
                .unwrap_or((cfg.capacity_per_s, cfg.burst));
            buckets.insert(class, Bucket::new(rate, burst));
        }
        Self { buckets }
    }

    /// Non-blocking token grab.
    pub fn try_acquire(&self, class: EndpointClass) -> bool {
        self.bucket(class).try_take()
    }

    /// Await a token. Sleeps in steps sized to the bucket's refill rate, so
    /// a caller never busy-spins.
    pub async fn acquire(&self, class: EndpointClass) {
        let bucket = self.bucket(class);
        loop {
            if bucket.try_take() {
                return;
            }
            let step = Duration::from_secs_f64((1.0 / bucket.rate_per_s).min(0.1).max(0.001));
            sleep(step).await;
        }
    }

    pub fn rejected(&self, class: EndpointClass) -> u64 {
        self.bucket(class).rejected.load(Ordering::Relaxed)
    }

    fn bucket(&self, class: EndpointClass) -> &Bucket {
        self.buckets.get(&class).expect("all classes populated at construction")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(rate: f64, burst: u64) -> RateLimiterConfig {
        RateLimiterConfig {
            capacity_per_s: rate,
            burst,
            endpoint_overrides: Default::default(),
        }
    }

    #[test]
    fn burst_is_honored_then_exhausted() {
        let rl = RateLimiter::new(&cfg(1.0, 5));
        for i in 0..5 {
            assert!(rl.try_acquire(EndpointClass::Orders), "token {i}");
        }
        assert!(!rl.try_acquire(EndpointClass::Orders));
        assert_eq!(rl.rejected(EndpointClass::Orders), 1);
    }

    #[test]
    fn classes_have_independent_buckets() {
        let rl = RateLimiter::new(&cfg(1.0, 1));
        assert!(rl.try_acquire(EndpointClass::Orders));
        assert!(!rl.try_acquire(EndpointClass::Orders));
        // Queries bucket untouched.
        assert!(rl.try_acquire(EndpointClass::Queries));
    }

    #[test]
    fn endpoint_override_applies() {
        let mut c = cfg(1.0, 1);
        c.endpoint_overrides.insert(
            "queries".to_string(),
            crate::config::EndpointOverride { capacity_per_s: 100.0, burst: 50 },
        );
        let rl = RateLimiter::new(&c);
        for _ in 0..50 {
            assert!(rl.try_acquire(EndpointClass::Queries));
        }
        assert!(!rl.try_acquire(EndpointClass::Queries));
        // Default bucket still burst=1.
        assert!(rl.try_acquire(EndpointClass::Orders));
        assert!(!rl.try_acquire(EndpointClass::Orders));
    }

    #[test]
    fn refill_restores_tokens() {
        let rl = RateLimiter::new(&cfg(1_000.0, 2));
        assert!(rl.try_acquire(EndpointClass::Orders));
        assert!(rl.try_acquire(EndpointClass::Orders));
        assert!(!rl.try_acquire(EndpointClass::Orders));
        std::thread::sleep(Duration::from_millis(10));
        assert!(rl.try_acquire(EndpointClass::Orders), "should refill at 1000/s");
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        let rl = RateLimiter::new(&cfg(200.0, 1));
        assert!(rl.try_acquire(EndpointClass::Orders));
        let started = Instant::now();
        rl.acquire(EndpointClass::Orders).await;
        // Refill at 200/s means roughly 5ms; generous upper bound.
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
