//! Token-bucket rate limiting, one bucket per endpoint.
//!
//! Callers block on `acquire_until` rather than exceeding the provider's
//! rate. Token accounting is fractional (refill is continuous), so a rate
//! of 0.5 req/s works the same way as 50 req/s.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single token bucket with a fixed capacity (burst) and refill rate.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    wakeup: Condvar,
    capacity: f64,
    refill_per_sec: f64,
}

impl TokenBucket {
    /// `refill_per_sec` tokens per second, up to `burst` stored tokens.
    /// The bucket starts full.
    pub fn new(refill_per_sec: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            wakeup: Condvar::new(),
            capacity,
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state, Instant::now());
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Block until a token is available or the deadline passes. Returns
    /// `false` on deadline. Acquisition is serialized by the bucket's lock,
    /// so concurrent callers cannot jointly overdraw it.
    pub fn acquire_until(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            let now = Instant::now();
            self.refill(&mut state, now);
            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return true;
            }
            if now >= deadline {
                return false;
            }
            // Time until the next whole token accrues, capped by the deadline.
            let deficit = 1.0 - state.tokens;
            let until_token = Duration::from_secs_f64(deficit / self.refill_per_sec);
            let wait = until_token.min(deadline - now);
            let (guard, _) = self.wakeup.wait_timeout(state, wait).unwrap();
            state = guard;
        }
    }
}

/// Per-endpoint token buckets sharing one rate/burst configuration.
///
/// Injected into the fetcher (never a global singleton) so independent
/// pipeline instances do not interfere.
#[derive(Debug)]
pub struct EndpointLimiter {
    buckets: Mutex<HashMap<String, std::sync::Arc<TokenBucket>>>,
    refill_per_sec: f64,
    burst: u32,
}

impl EndpointLimiter {
    pub fn new(refill_per_sec: f64, burst: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            refill_per_sec,
            burst,
        }
    }

    /// The bucket for an endpoint, created on first use.
    pub fn bucket(&self, endpoint: &str) -> std::sync::Arc<TokenBucket> {
        let mut buckets = self.buckets.lock().unwrap();
        buckets
            .entry(endpoint.to_string())
            .or_insert_with(|| std::sync::Arc::new(TokenBucket::new(self.refill_per_sec, self.burst)))
            .clone()
    }
}
