//! RateLimiter — token bucket per (endpoint-class, caller-identity)
//! (SPEC_FULL §4.8). Grounded directly on the teacher's
//! `proxy/filter/rate_limit.rs` `Bucket`/`try_acquire` design (tokio-Mutex
//! protected refill, not CAS — the teacher's own comment there explains why
//! CAS under-refills under contention), narrowed to the token-bucket mode
//! only since this spec has no sliding-window requirement, and re-keyed from
//! route name to (endpoint class, caller identity).

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

const PRECISION: u64 = 1_000_000;
const GC_EXPIRE_SECS: u64 = 300;
const GC_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Rpc,
    Health,
    Internal,
}

pub struct RateLimitConfig {
    pub rpc_per_min: f64,
    pub rpc_burst: u64,
    pub health_per_min: f64,
    pub health_burst: u64,
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rpc_per_min: 100.0,
            rpc_burst: 20,
            health_per_min: 300.0,
            health_burst: 50,
            enabled: true,
        }
    }
}

/// Outcome of an admission check: either allowed, or rejected with the
/// number of seconds a caller should wait before retrying.
pub enum Admission {
    Allowed,
    Rejected { retry_after_secs: u64 },
}

struct Bucket {
    inner: Mutex<BucketInner>,
    last_access: AtomicU64,
}

struct BucketInner {
    tokens: f64,
    last_refill: u64,
    rate_per_us: f64,
    max_tokens: f64,
}

pub struct RateLimiter {
    buckets: DashMap<String, Arc<Bucket>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    fn limits_for(&self, class: EndpointClass) -> Option<(f64, u64)> {
        match class {
            EndpointClass::Rpc => Some((self.config.rpc_per_min / 60.0, self.config.rpc_burst)),
            EndpointClass::Health => {
                Some((self.config.health_per_min / 60.0, self.config.health_burst))
            }
            EndpointClass::Internal => None,
        }
    }

    /// `caller_identity` is the authenticated node_id when available, else
    /// the source IP, per spec.
    pub async fn check(&self, class: EndpointClass, caller_identity: &str) -> Admission {
        if !self.config.enabled {
            return Admission::Allowed;
        }
        let Some((rate_per_sec, burst)) = self.limits_for(class) else {
            return Admission::Allowed;
        };

        let key = format!("{class:?}:{caller_identity}");
        let max_tokens = (rate_per_sec + burst as f64) * PRECISION as f64;
        let rate_per_us = rate_per_sec / 1_000_000.0;

        let bucket = if let Some(entry) = self.buckets.get(&key) {
            entry.value().clone()
        } else {
            self.buckets
                .entry(key)
                .or_insert_with(|| {
                    let now = now_us();
                    Arc::new(Bucket {
                        inner: Mutex::new(BucketInner {
                            tokens: max_tokens,
                            last_refill: now,
                            rate_per_us,
                            max_tokens,
                        }),
                        last_access: AtomicU64::new(now),
                    })
                })
                .clone()
        };

        bucket.last_access.store(now_us(), Ordering::Relaxed);
        bucket.try_acquire().await
    }

    pub fn start_gc(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                limiter.evict_stale();
            }
        });
    }

    fn evict_stale(&self) {
        let now = now_us();
        let expire_us = GC_EXPIRE_SECS * 1_000_000;
        self.buckets
            .retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);
    }
}

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

impl Bucket {
    async fn try_acquire(&self) -> Admission {
        let now = now_us();
        let mut b = self.inner.lock().await;

        let elapsed = now.saturating_sub(b.last_refill);
        if elapsed > 0 {
            let refill = elapsed as f64 * b.rate_per_us * PRECISION as f64;
            b.tokens = (b.tokens + refill).min(b.max_tokens);
            b.last_refill = now;
        }

        let cost = PRECISION as f64;
        if b.tokens >= cost {
            b.tokens -= cost;
            Admission::Allowed
        } else {
            let deficit = cost - b.tokens;
            let seconds = if b.rate_per_us > 0.0 {
                (deficit / (b.rate_per_us * PRECISION as f64) / 1_000_000.0).ceil().max(1.0) as u64
            } else {
                u64::MAX
            };
            Admission::Rejected {
                retry_after_secs: seconds,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_burst_then_rejects() {
        let limiter = RateLimiter::new(RateLimitConfig {
            rpc_per_min: 60.0,
            rpc_burst: 2,
            ..Default::default()
        });
        let mut allowed = 0;
        for _ in 0..5 {
            if matches!(
                limiter.check(EndpointClass::Rpc, "node-a").await,
                Admission::Allowed
            ) {
                allowed += 1;
            }
        }
        assert!(allowed <= 3, "expected burst+1 allowed at most, got {allowed}");
    }

    #[tokio::test]
    async fn rejection_carries_positive_retry_after() {
        let limiter = RateLimiter::new(RateLimitConfig {
            rpc_per_min: 1.0,
            rpc_burst: 1,
            ..Default::default()
        });
        assert!(matches!(
            limiter.check(EndpointClass::Rpc, "node-a").await,
            Admission::Allowed
        ));
        assert!(matches!(
            limiter.check(EndpointClass::Rpc, "node-a").await,
            Admission::Allowed
        ));
        match limiter.check(EndpointClass::Rpc, "node-a").await {
            Admission::Rejected { retry_after_secs } => assert!(retry_after_secs > 0),
            Admission::Allowed => panic!("expected rejection after exhausting burst"),
        }
    }

    #[tokio::test]
    async fn internal_class_is_unlimited() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        for _ in 0..1000 {
            assert!(matches!(
                limiter.check(EndpointClass::Internal, "node-a").await,
                Admission::Allowed
            ));
        }
    }

    #[tokio::test]
    async fn distinct_callers_have_independent_buckets() {
        let limiter = RateLimiter::new(RateLimitConfig {
            rpc_per_min: 60.0,
            rpc_burst: 1,
            ..Default::default()
        });
        assert!(matches!(
            limiter.check(EndpointClass::Rpc, "node-a").await,
            Admission::Allowed
        ));
        assert!(matches!(
            limiter.check(EndpointClass::Rpc, "node-b").await,
            Admission::Allowed
        ));
    }
}
