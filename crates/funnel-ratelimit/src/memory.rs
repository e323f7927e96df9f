//! In-memory rate limiting
//!
//! One token bucket per `<tenant>:<class>` key in a concurrent map.
//! Buckets untouched past the idle window are evicted by a periodic sweep.

use crate::bucket::TokenBucket;
use crate::RateLimitDecision;
use chrono::Utc;
use dashmap::DashMap;
use funnel_common::LimitRule;
use std::sync::Arc;
use std::time::Duration;

pub struct InMemoryLimiter {
    buckets: DashMap<String, (LimitRule, Arc<TokenBucket>)>,
}

fn new_bucket(rule: LimitRule) -> Arc<TokenBucket> {
    let refill_rate = f64::from(rule.requests) / (rule.window_ms as f64 / 1000.0);
    Arc::new(TokenBucket::new(rule.requests, refill_rate))
}

impl InMemoryLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    fn bucket(&self, key: &str, rule: LimitRule) -> Arc<TokenBucket> {
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| (rule, new_bucket(rule)));

        // A tier change mid-flight replaces the bucket; the old balance
        // is meaningless under the new capacity and refill rate.
        if entry.0 != rule {
            *entry = (rule, new_bucket(rule));
        }
        entry.1.clone()
    }

    /// Admission check: refill, then admit iff at least one token remains
    pub fn check(&self, key: &str, rule: LimitRule) -> RateLimitDecision {
        let bucket = self.bucket(key, rule);
        let allowed = bucket.try_acquire();
        let remaining = bucket.remaining();

        // Conservative estimate: a denied caller is told to come back
        // after a full window.
        let retry_after_secs = if allowed {
            None
        } else {
            Some(rule.window_ms.div_ceil(1000))
        };

        RateLimitDecision {
            allowed,
            remaining,
            limit: rule.requests,
            reset_time: Utc::now()
                + chrono::Duration::from_std(bucket.time_to_next_token())
                    .unwrap_or_else(|_| chrono::Duration::milliseconds(rule.window_ms as i64)),
            retry_after_secs,
        }
    }

    /// Record usage without an admission decision
    pub fn record(&self, key: &str, rule: LimitRule) {
        self.bucket(key, rule).force_consume();
    }

    /// Remaining whole tokens for a key without consuming
    pub fn remaining(&self, key: &str, rule: LimitRule) -> u32 {
        self.bucket(key, rule).remaining()
    }

    /// Drop every bucket whose key starts with `prefix`
    pub fn remove_prefix(&self, prefix: &str) {
        self.buckets.retain(|k, _| !k.starts_with(prefix));
    }

    /// Drop buckets idle for longer than `max_idle`; returns evicted count
    pub fn purge_idle(&self, max_idle: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, (_, bucket)| bucket.last_access().elapsed() < max_idle);
        before - self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for InMemoryLimiter {
    fn default() -> Self {
        Self::new()
    }
}
