//! Pluggable gate in front of service starts.
//!
//! The default policy is a token bucket per service id and per caller;
//! denials carry a suggested back-off so clients can retry politely.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Outcome of one admission check.
#[derive(Clone, Debug)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub delay_seconds: Option<f64>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            delay_seconds: None,
        }
    }

    pub fn deny(reason: impl Into<String>, delay_seconds: f64) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            delay_seconds: Some(delay_seconds),
        }
    }
}

/// Gate consulted before every service start.
pub trait SecurityPolicy: Send + Sync {
    fn check_can_start_service(&self, service_id: &str, caller: Option<&str>) -> PolicyDecision;
}

/// Policy that admits everything; useful for embedding and tests.
pub struct AllowAllPolicy;

impl SecurityPolicy for AllowAllPolicy {
    fn check_can_start_service(&self, _service_id: &str, _caller: Option<&str>) -> PolicyDecision {
        PolicyDecision::allow()
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter keyed by service id and caller.
pub struct TokenBucketPolicy {
    capacity: f64,
    refill_per_second: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl TokenBucketPolicy {
    pub fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token from the named bucket, reporting the wait time when
    /// the bucket is dry.
    fn try_take(&self, key: &str) -> Result<(), f64> {
        let mut buckets = self.buckets.lock().expect("bucket table poisoned");
        let now = Instant::now();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_second).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err((1.0 - bucket.tokens) / self.refill_per_second)
        }
    }
}

impl Default for TokenBucketPolicy {
    /// Five starts of headroom, refilling one every ten seconds.
    fn default() -> Self {
        Self::new(5.0, 0.1)
    }
}

impl SecurityPolicy for TokenBucketPolicy {
    fn check_can_start_service(&self, service_id: &str, caller: Option<&str>) -> PolicyDecision {
        if let Err(delay) = self.try_take(&format!("service:{service_id}")) {
            return PolicyDecision::deny(
                format!("service '{service_id}' is starting too often"),
                delay,
            );
        }
        if let Some(caller) = caller {
            if let Err(delay) = self.try_take(&format!("caller:{caller}")) {
                return PolicyDecision::deny(
                    format!("caller '{caller}' is starting services too often"),
                    delay,
                );
            }
        }
        PolicyDecision::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_within_capacity_are_admitted() {
        let policy = TokenBucketPolicy::new(3.0, 0.1);
        for _ in 0..3 {
            assert!(policy.check_can_start_service("svc", None).allowed);
        }
    }

    #[test]
    fn exhausted_bucket_denies_with_backoff() {
        let policy = TokenBucketPolicy::new(1.0, 0.1);
        assert!(policy.check_can_start_service("svc", None).allowed);

        let decision = policy.check_can_start_service("svc", None);
        assert!(!decision.allowed);
        assert!(decision.reason.as_deref().unwrap_or("").contains("svc"));
        let delay = decision.delay_seconds.expect("denials carry a hint");
        assert!(delay > 0.0 && delay <= 10.0);
    }

    #[test]
    fn service_buckets_are_independent() {
        let policy = TokenBucketPolicy::new(1.0, 0.1);
        assert!(policy.check_can_start_service("a", None).allowed);
        assert!(policy.check_can_start_service("b", None).allowed);
        assert!(!policy.check_can_start_service("a", None).allowed);
    }

    #[test]
    fn caller_bucket_is_checked_separately() {
        let policy = TokenBucketPolicy::new(1.0, 0.1);
        assert!(policy.check_can_start_service("a", Some("ci")).allowed);
        // Fresh service, same caller: the caller bucket is dry.
        let decision = policy.check_can_start_service("b", Some("ci"));
        assert!(!decision.allowed);
        assert!(decision.reason.as_deref().unwrap_or("").contains("ci"));
    }
}
