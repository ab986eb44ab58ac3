//! Token-bucket rate limiting keyed by endpoint class and client key.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use goatcounter_core::config::{Limit, RateLimitClass, RateLimits};

const SHARDS: usize = 32;

type BucketKey = (RateLimitClass, String);

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn refill(&mut self, limit: Limit, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        let rate = f64::from(limit.requests) / limit.per.as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(f64::from(limit.requests));
        self.last = now;
    }
}

/// Outcome of a [`RateLimiter::check`], with the values for the
/// `X-Rate-Limit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the next request would be allowed.
    pub reset: Duration,
}

pub struct RateLimiter {
    limits: RateLimits,
    shards: [Mutex<HashMap<BucketKey, Bucket>>; SHARDS],
}

fn shard_index(class: RateLimitClass, key: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    class.hash(&mut hasher);
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARDS
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            shards: std::array::from_fn(|_| Mutex::new(HashMap::new())),
        }
    }

    pub fn check(&self, class: RateLimitClass, key: &str) -> Decision {
        self.check_at(class, key, Instant::now())
    }

    pub fn check_at(&self, class: RateLimitClass, key: &str, now: Instant) -> Decision {
        let limit = self.limits.get(class);
        let mut shard = self.shards[shard_index(class, key)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let bucket = shard
            .entry((class, key.to_string()))
            .or_insert_with(|| Bucket {
                tokens: f64::from(limit.requests),
                last: now,
            });
        bucket.refill(limit, now);

        let rate = f64::from(limit.requests) / limit.per.as_secs_f64();
        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }
        let reset = if bucket.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - bucket.tokens) / rate)
        };
        Decision {
            allowed,
            limit: limit.requests,
            remaining: bucket.tokens.floor() as u32,
            reset,
        }
    }

    /// Drop buckets that have refilled completely; they behave the same as a
    /// missing entry. Returns how many were removed.
    pub fn prune(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut map = shard.lock().unwrap_or_else(PoisonError::into_inner);
            let before = map.len();
            map.retain(|(class, _), bucket| {
                let limit = self.limits.get(*class);
                let mut b = *bucket;
                b.refill(limit, now);
                b.tokens < f64::from(limit.requests)
            });
            removed += before - map.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_allows_four_per_second() {
        let rl = RateLimiter::new(RateLimits::default());
        let t0 = Instant::now();
        for i in 0..4 {
            let d = rl.check_at(RateLimitClass::Count, "1.1.1.1", t0);
            assert!(d.allowed, "request {i}");
        }
        let d = rl.check_at(RateLimitClass::Count, "1.1.1.1", t0);
        assert!(!d.allowed);
        assert_eq!(d.limit, 4);
        assert_eq!(d.remaining, 0);
        assert!(d.reset > Duration::ZERO && d.reset <= Duration::from_secs(1));

        // Other clients have their own bucket.
        assert!(rl.check_at(RateLimitClass::Count, "2.2.2.2", t0).allowed);

        let later = t0 + Duration::from_secs(1);
        assert!(rl.check_at(RateLimitClass::Count, "1.1.1.1", later).allowed);
    }

    #[test]
    fn classes_are_independent() {
        let mut limits = RateLimits::default();
        limits.set(RateLimitClass::Export, Limit::new(1, 3600));
        let rl = RateLimiter::new(limits);
        let t0 = Instant::now();
        assert!(rl.check_at(RateLimitClass::Export, "k", t0).allowed);
        assert!(!rl.check_at(RateLimitClass::Export, "k", t0).allowed);
        assert!(rl.check_at(RateLimitClass::Api, "k", t0).allowed);
    }

    #[test]
    fn prune_drops_full_buckets() {
        let rl = RateLimiter::new(RateLimits::default());
        let t0 = Instant::now();
        rl.check_at(RateLimitClass::Count, "a", t0);
        rl.check_at(RateLimitClass::Export, "b", t0);
        assert_eq!(rl.len(), 2);

        // Count refills in a second, export takes an hour.
        let removed = rl.prune(t0 + Duration::from_secs(2));
        assert_eq!(removed, 1);
        assert_eq!(rl.len(), 1);
    }
}
