//! OpenFunnel Rate Limiter
//!
//! Per-tenant, per-endpoint-class admission control. In-memory mode uses
//! token buckets; when a Redis backend is configured the limiter prefers
//! a sliding-window log there, degrading to the in-memory mode call by
//! call whenever the backend errors or times out. Infrastructure failure
//! never denies a request on its own: the posture on limiter-internal
//! error is allow.

use chrono::{DateTime, Utc};
use funnel_common::{EndpointClass, RateLimitConfig, TenantId, Tier};
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub mod bucket;
pub mod distributed;
pub mod memory;

pub use bucket::TokenBucket;
pub use distributed::RedisSlidingWindow;
pub use memory::InMemoryLimiter;

/// Internal rate-limiter failure; converted into a fallback decision at
/// the limiter boundary, never propagated to admission.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("distributed backend unavailable: {0}")]
    Backend(String),
}

/// Admission decision for one request
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Whole requests left in the current window
    pub remaining: u32,
    pub limit: u32,
    /// When quota next becomes available
    pub reset_time: DateTime<Utc>,
    /// Set on denial; conservative full-window estimate in seconds
    pub retry_after_secs: Option<u64>,
}

/// Rate-limiter counters; unregistered until handed a registry
pub struct LimiterMetrics {
    allowed: IntCounterVec,
    violations: IntCounterVec,
    fallbacks: IntCounter,
    backend_errors: IntCounter,
}

impl LimiterMetrics {
    fn new() -> Self {
        Self {
            allowed: IntCounterVec::new(
                Opts::new("funnel_ratelimit_allowed_total", "Admitted requests"),
                &["class"],
            )
            .expect("static metric definition"),
            violations: IntCounterVec::new(
                Opts::new("funnel_ratelimit_violations_total", "Denied requests"),
                &["class"],
            )
            .expect("static metric definition"),
            fallbacks: IntCounter::new(
                "funnel_ratelimit_fallback_total",
                "Calls degraded from the distributed backend to in-memory mode",
            )
            .expect("static metric definition"),
            backend_errors: IntCounter::new(
                "funnel_ratelimit_backend_errors_total",
                "Distributed backend errors and timeouts",
            )
            .expect("static metric definition"),
        }
    }

    /// Register every counter on `registry`
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.allowed.clone()))?;
        registry.register(Box::new(self.violations.clone()))?;
        registry.register(Box::new(self.fallbacks.clone()))?;
        registry.register(Box::new(self.backend_errors.clone()))?;
        Ok(())
    }

    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.get()
    }
}

/// Per-tenant rate limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    memory: InMemoryLimiter,
    distributed: Option<RedisSlidingWindow>,
    metrics: LimiterMetrics,
    // Tracks outage state so a flapping backend logs on transitions, not
    // once per request.
    backend_down: AtomicBool,
}

impl RateLimiter {
    /// In-memory-only limiter
    pub fn in_memory(config: RateLimitConfig) -> Self {
        Self {
            config,
            memory: InMemoryLimiter::new(),
            distributed: None,
            metrics: LimiterMetrics::new(),
            backend_down: AtomicBool::new(false),
        }
    }

    /// Limiter preferring the given distributed backend
    pub fn with_distributed(config: RateLimitConfig, backend: RedisSlidingWindow) -> Self {
        Self {
            distributed: Some(backend),
            ..Self::in_memory(config)
        }
    }

    pub fn metrics(&self) -> &LimiterMetrics {
        &self.metrics
    }

    fn key(tenant: &str, class: EndpointClass) -> String {
        format!("{tenant}:{class}")
    }

    /// Check and consume one unit of quota
    pub async fn check_limit(
        &self,
        tenant: &TenantId,
        class: EndpointClass,
        tier: Tier,
    ) -> RateLimitDecision {
        let rule = self.config.rule_for(tier, class);
        let key = Self::key(tenant, class);

        let decision = match &self.distributed {
            Some(backend) => match backend.check(&key, rule).await {
                Ok(verdict) => {
                    self.note_backend_up();
                    let remaining = u64::from(rule.requests).saturating_sub(verdict.count) as u32;
                    RateLimitDecision {
                        allowed: verdict.allowed,
                        remaining,
                        limit: rule.requests,
                        reset_time: Utc::now() + chrono::Duration::milliseconds(rule.window_ms as i64),
                        retry_after_secs: if verdict.allowed {
                            None
                        } else {
                            Some(rule.window_ms.div_ceil(1000))
                        },
                    }
                }
                Err(err) => {
                    self.note_backend_error(&err);
                    self.memory.check(&key, rule)
                }
            },
            None => self.memory.check(&key, rule),
        };

        if decision.allowed {
            self.metrics.allowed.with_label_values(&[class.as_str()]).inc();
        } else {
            self.metrics
                .violations
                .with_label_values(&[class.as_str()])
                .inc();
        }
        decision
    }

    /// Record usage without an admission decision
    pub async fn increment_usage(&self, tenant: &TenantId, class: EndpointClass, tier: Tier) {
        let rule = self.config.rule_for(tier, class);
        let key = Self::key(tenant, class);

        if let Some(backend) = &self.distributed {
            match backend.record(&key, rule).await {
                Ok(()) => {
                    self.note_backend_up();
                    return;
                }
                Err(err) => self.note_backend_error(&err),
            }
        }
        self.memory.record(&key, rule);
    }

    /// Remaining quota without consuming any
    pub async fn remaining_quota(
        &self,
        tenant: &TenantId,
        class: EndpointClass,
        tier: Tier,
    ) -> u32 {
        let rule = self.config.rule_for(tier, class);
        let key = Self::key(tenant, class);

        if let Some(backend) = &self.distributed {
            match backend.count(&key, rule).await {
                Ok(count) => {
                    self.note_backend_up();
                    return u64::from(rule.requests).saturating_sub(count) as u32;
                }
                Err(err) => self.note_backend_error(&err),
            }
        }
        self.memory.remaining(&key, rule)
    }

    /// Clear every bucket and window key belonging to `tenant`, in both modes
    pub async fn reset_tenant_limits(&self, tenant: &TenantId) {
        self.memory.remove_prefix(&format!("{tenant}:"));

        if let Some(backend) = &self.distributed {
            if let Err(err) = backend.reset_tenant(tenant).await {
                self.note_backend_error(&err);
            } else {
                self.note_backend_up();
            }
        }
    }

    /// Start the idle-bucket sweep for the in-memory mode
    pub fn start_idle_sweeper(self: &Arc<Self>) -> BucketSweeper {
        let limiter = self.clone();
        let interval = Duration::from_secs(self.config.sweep_interval_secs);
        let max_idle = Duration::from_secs(self.config.bucket_idle_secs);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = limiter.memory.purge_idle(max_idle);
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted idle rate-limit buckets");
                }
            }
        });
        BucketSweeper { handle }
    }

    fn note_backend_error(&self, err: &RateLimitError) {
        self.metrics.backend_errors.inc();
        self.metrics.fallbacks.inc();
        if !self.backend_down.swap(true, Ordering::Relaxed) {
            tracing::warn!(error = %err, "rate-limit backend unavailable, serving from in-memory mode");
        }
    }

    fn note_backend_up(&self) {
        if self.backend_down.swap(false, Ordering::Relaxed) {
            tracing::info!("rate-limit backend reachable again");
        }
    }
}

/// Handle to the idle-bucket sweep; aborts on stop or drop
pub struct BucketSweeper {
    handle: JoinHandle<()>,
}

impl BucketSweeper {
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for BucketSweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funnel_common::LimitRule;
    use std::collections::HashMap;

    fn config_with(requests: u32, window_ms: u64) -> RateLimitConfig {
        let mut classes = HashMap::new();
        for class in EndpointClass::ALL {
            classes.insert(class, LimitRule::new(requests, window_ms));
        }
        let mut limits = HashMap::new();
        limits.insert(Tier::Free, classes);
        RateLimitConfig {
            limits,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn admits_capacity_then_denies() {
        let limiter = RateLimiter::in_memory(config_with(5, 60_000));
        let tenant = "t1".to_string();

        for expected_remaining in (0..5).rev() {
            let d = limiter
                .check_limit(&tenant, EndpointClass::Events, Tier::Free)
                .await;
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }

        let denied = limiter
            .check_limit(&tenant, EndpointClass::Events, Tier::Free)
            .await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after_secs, Some(60));
    }

    #[tokio::test]
    async fn unknown_tier_uses_most_conservative_limits() {
        let limiter = RateLimiter::in_memory(config_with(1, 60_000));
        let tenant = "t1".to_string();

        // Pro is not configured; Free's single-request limit applies.
        let first = limiter
            .check_limit(&tenant, EndpointClass::Events, Tier::Pro)
            .await;
        assert!(first.allowed);
        let second = limiter
            .check_limit(&tenant, EndpointClass::Events, Tier::Pro)
            .await;
        assert!(!second.allowed);
    }

    #[tokio::test]
    async fn tenants_and_classes_are_isolated() {
        let limiter = RateLimiter::in_memory(config_with(1, 60_000));

        let a = "tenant-a".to_string();
        let b = "tenant-b".to_string();

        assert!(limiter.check_limit(&a, EndpointClass::Events, Tier::Free).await.allowed);
        assert!(!limiter.check_limit(&a, EndpointClass::Events, Tier::Free).await.allowed);

        // Tenant B and another class of tenant A still have full quota.
        assert!(limiter.check_limit(&b, EndpointClass::Events, Tier::Free).await.allowed);
        assert!(limiter.check_limit(&a, EndpointClass::Export, Tier::Free).await.allowed);
    }

    #[tokio::test]
    async fn reset_restores_full_quota() {
        let limiter = RateLimiter::in_memory(config_with(1, 60_000));
        let tenant = "t1".to_string();

        limiter.check_limit(&tenant, EndpointClass::Events, Tier::Free).await;
        assert!(!limiter.check_limit(&tenant, EndpointClass::Events, Tier::Free).await.allowed);

        limiter.reset_tenant_limits(&tenant).await;
        assert!(limiter.check_limit(&tenant, EndpointClass::Events, Tier::Free).await.allowed);
    }

    #[tokio::test]
    async fn increment_usage_consumes_quota() {
        let limiter = RateLimiter::in_memory(config_with(2, 60_000));
        let tenant = "t1".to_string();

        limiter.increment_usage(&tenant, EndpointClass::Events, Tier::Free).await;
        assert_eq!(
            limiter.remaining_quota(&tenant, EndpointClass::Events, Tier::Free).await,
            1
        );
    }

    #[tokio::test]
    async fn quota_refills_after_window() {
        let limiter = RateLimiter::in_memory(config_with(2, 200));
        let tenant = "t1".to_string();

        limiter.check_limit(&tenant, EndpointClass::Events, Tier::Free).await;
        limiter.check_limit(&tenant, EndpointClass::Events, Tier::Free).await;
        assert!(!limiter.check_limit(&tenant, EndpointClass::Events, Tier::Free).await.allowed);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(limiter.check_limit(&tenant, EndpointClass::Events, Tier::Free).await.allowed);
    }

    #[tokio::test]
    async fn metrics_track_allowed_and_violations() {
        let limiter = RateLimiter::in_memory(config_with(1, 60_000));
        let tenant = "t1".to_string();

        limiter.check_limit(&tenant, EndpointClass::Events, Tier::Free).await;
        limiter.check_limit(&tenant, EndpointClass::Events, Tier::Free).await;

        let registry = Registry::new();
        limiter.metrics().register(&registry).unwrap();
        let families = registry.gather();
        assert!(families.iter().any(|f| f.get_name() == "funnel_ratelimit_allowed_total"));
        assert!(families.iter().any(|f| f.get_name() == "funnel_ratelimit_violations_total"));
    }
}
