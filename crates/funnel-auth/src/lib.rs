//! OpenFunnel Credential Validation
//!
//! Resolves an opaque bearer credential (API key or externally issued
//! JWT) to a tenant/workspace/scope context, memoizing results in the
//! shared TTL cache. Positive and negative results are both cached, keyed
//! by a hash of the raw credential, never the credential itself.
//!
//! Admission fail-open applies to the rate limiter only; an unreachable
//! identity store makes a credential invalid here (fail-closed).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use funnel_cache::TtlCache;
use funnel_common::{AuthCacheConfig, TenantId, Tier, WorkspaceId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

pub mod store;

pub use store::{InMemoryIdentityStore, JwtIdentityStore};

/// Identity/authorization store failure
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("identity store unavailable: {0}")]
    BackendUnavailable(String),
}

/// Context resolved for a credential; immutable once constructed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialContext {
    pub tenant_id: TenantId,
    pub workspace_id: Option<WorkspaceId>,
    pub scopes: Vec<String>,
    pub principal_id: String,
    pub tier: Tier,
    /// Hard upper bound on trust, regardless of cache TTL
    pub valid_until: DateTime<Utc>,
}

/// Result of validating one raw credential
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub tenant_id: Option<TenantId>,
    pub workspace_id: Option<WorkspaceId>,
    pub scopes: Vec<String>,
    pub principal_id: Option<String>,
    pub tier: Tier,
}

impl ValidationOutcome {
    fn valid(ctx: &CredentialContext) -> Self {
        Self {
            is_valid: true,
            tenant_id: Some(ctx.tenant_id.clone()),
            workspace_id: ctx.workspace_id.clone(),
            scopes: ctx.scopes.clone(),
            principal_id: Some(ctx.principal_id.clone()),
            tier: ctx.tier,
        }
    }

    fn invalid() -> Self {
        Self {
            is_valid: false,
            tenant_id: None,
            workspace_id: None,
            scopes: Vec::new(),
            principal_id: None,
            tier: Tier::most_conservative(),
        }
    }
}

/// Memoized validation result; negative entries keep a much shorter TTL
#[derive(Debug, Clone)]
pub enum CachedAuth {
    Valid(CredentialContext),
    Invalid,
}

/// External identity/authorization store
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Resolve a raw credential; `None` means unknown or rejected
    async fn resolve(&self, raw: &str) -> Result<Option<CredentialContext>, AuthError>;

    /// Revoke a credential at the source
    async fn revoke(&self, raw: &str) -> Result<(), AuthError>;

    /// Best-effort last-used bookkeeping; never on the request path
    async fn note_usage(&self, _principal_id: &str) {}
}

/// Cache type shared between the validator and its owner
pub type AuthCache = TtlCache<String, CachedAuth>;

/// Cache-accelerated credential validator
pub struct CredentialValidator {
    store: Arc<dyn IdentityStore>,
    cache: Arc<AuthCache>,
    positive_ttl: Duration,
    negative_ttl: Duration,
}

impl CredentialValidator {
    pub fn new(store: Arc<dyn IdentityStore>, cache: Arc<AuthCache>, cfg: &AuthCacheConfig) -> Self {
        Self {
            store,
            cache,
            positive_ttl: Duration::from_secs(cfg.positive_ttl_secs),
            negative_ttl: Duration::from_secs(cfg.negative_ttl_secs),
        }
    }

    /// Hash under which a credential is cached; the raw value never
    /// becomes a cache key.
    pub fn cache_key(raw: &str) -> String {
        hex::encode(Sha256::digest(raw.as_bytes()))
    }

    /// Validate a raw credential, consulting the cache first
    pub async fn validate(&self, raw: &str) -> ValidationOutcome {
        if raw.trim().is_empty() {
            return ValidationOutcome::invalid();
        }

        let key = Self::cache_key(raw);

        match self.cache.get(&key) {
            Some(CachedAuth::Valid(ctx)) => {
                if ctx.valid_until <= Utc::now() {
                    // Cached trust never outlives the credential itself.
                    self.cache.delete(&key);
                } else {
                    let store = self.store.clone();
                    let principal = ctx.principal_id.clone();
                    tokio::spawn(async move {
                        store.note_usage(&principal).await;
                    });
                    return ValidationOutcome::valid(&ctx);
                }
            }
            Some(CachedAuth::Invalid) => return ValidationOutcome::invalid(),
            None => {}
        }

        match self.store.resolve(raw).await {
            Ok(Some(ctx)) => {
                let now = Utc::now();
                if ctx.valid_until <= now {
                    self.cache
                        .set_with_ttl(key, CachedAuth::Invalid, self.negative_ttl);
                    return ValidationOutcome::invalid();
                }

                // Cap the cache TTL at the credential's own remaining life.
                let remaining = (ctx.valid_until - now)
                    .to_std()
                    .unwrap_or(self.positive_ttl);
                let ttl = self.positive_ttl.min(remaining);
                let outcome = ValidationOutcome::valid(&ctx);
                self.cache.set_with_ttl(key, CachedAuth::Valid(ctx), ttl);
                outcome
            }
            Ok(None) => {
                self.cache
                    .set_with_ttl(key, CachedAuth::Invalid, self.negative_ttl);
                ValidationOutcome::invalid()
            }
            Err(err) => {
                // Not cached: the store may recover on the next request.
                tracing::warn!(error = %err, "identity store lookup failed");
                ValidationOutcome::invalid()
            }
        }
    }

    /// Revoke a credential: the cache entry dies immediately, never by
    /// passive expiry.
    pub async fn revoke(&self, raw: &str) -> Result<(), AuthError> {
        self.cache.delete(&Self::cache_key(raw));
        self.store.revoke(raw).await
    }

    pub fn cache(&self) -> &Arc<AuthCache> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        inner: InMemoryIdentityStore,
        resolves: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: InMemoryIdentityStore::new(),
                resolves: AtomicUsize::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl IdentityStore for CountingStore {
        async fn resolve(&self, raw: &str) -> Result<Option<CredentialContext>, AuthError> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(AuthError::BackendUnavailable("store offline".into()));
            }
            self.inner.resolve(raw).await
        }

        async fn revoke(&self, raw: &str) -> Result<(), AuthError> {
            self.inner.revoke(raw).await
        }
    }

    fn context(tenant: &str) -> CredentialContext {
        CredentialContext {
            tenant_id: tenant.to_string(),
            workspace_id: Some("ws-1".to_string()),
            scopes: vec!["events:write".to_string()],
            principal_id: "key-1".to_string(),
            tier: Tier::Pro,
            valid_until: Utc::now() + chrono::Duration::hours(1),
        }
    }

    fn validator(store: Arc<CountingStore>) -> CredentialValidator {
        let cache = Arc::new(AuthCache::new(100, Duration::from_secs(300)));
        CredentialValidator::new(store, cache, &AuthCacheConfig::default())
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let store = Arc::new(CountingStore::new());
        store.inner.insert("key-abc", context("t1"));
        let v = validator(store.clone());

        let first = v.validate("key-abc").await;
        assert!(first.is_valid);
        assert_eq!(first.tenant_id.as_deref(), Some("t1"));

        let second = v.validate("key-abc").await;
        assert!(second.is_valid);
        assert_eq!(store.resolves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn negative_results_are_cached_too() {
        let store = Arc::new(CountingStore::new());
        let v = validator(store.clone());

        assert!(!v.validate("unknown").await.is_valid);
        assert!(!v.validate("unknown").await.is_valid);
        assert_eq!(store.resolves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn revocation_invalidates_immediately() {
        let store = Arc::new(CountingStore::new());
        store.inner.insert("key-abc", context("t1"));
        let v = validator(store.clone());

        assert!(v.validate("key-abc").await.is_valid);
        v.revoke("key-abc").await.unwrap();
        assert!(!v.validate("key-abc").await.is_valid);
    }

    #[tokio::test]
    async fn cached_trust_stops_at_valid_until() {
        let store = Arc::new(CountingStore::new());
        let mut ctx = context("t1");
        ctx.valid_until = Utc::now() + chrono::Duration::milliseconds(50);
        store.inner.insert("key-abc", ctx);
        let v = validator(store.clone());

        assert!(v.validate("key-abc").await.is_valid);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!v.validate("key-abc").await.is_valid);
    }

    #[tokio::test]
    async fn cache_is_keyed_by_hash_not_raw_credential() {
        let store = Arc::new(CountingStore::new());
        store.inner.insert("key-abc", context("t1"));
        let v = validator(store.clone());
        v.validate("key-abc").await;

        assert!(v.cache().has(&CredentialValidator::cache_key("key-abc")));
        assert!(!v.cache().has(&"key-abc".to_string()));
    }

    #[tokio::test]
    async fn store_outage_is_not_cached() {
        let store = Arc::new(CountingStore::new());
        store.inner.insert("key-abc", context("t1"));
        store.fail.store(true, Ordering::SeqCst);
        let v = validator(store.clone());

        assert!(!v.validate("key-abc").await.is_valid);

        // Store recovers; the next request resolves instead of hitting a
        // poisoned negative entry.
        store.fail.store(false, Ordering::SeqCst);
        assert!(v.validate("key-abc").await.is_valid);
        assert_eq!(store.resolves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_credential_is_invalid_without_lookup() {
        let store = Arc::new(CountingStore::new());
        let v = validator(store.clone());
        assert!(!v.validate("   ").await.is_valid);
        assert_eq!(store.resolves.load(Ordering::SeqCst), 0);
    }
}
