//! Static configuration surface
//!
//! Loaded once at startup from an optional file plus `FUNNEL_`-prefixed
//! environment variables, immutable thereafter. Key material and
//! fingerprint secrets arrive here and only here.

use crate::{EndpointClass, Tier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration load error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),
}

/// Top-level configuration for the protective core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub redis: RedisConfig,
    pub crypto: CryptoConfig,
    pub auth: AuthCacheConfig,
}

impl CoreConfig {
    /// Load from `<path>.{toml,yaml,json}` (optional) and `FUNNEL_*` env vars
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("FUNNEL").separator("__"))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }
}

/// TTL/LRU cache tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Hard cap on entry count
    pub max_entries: usize,
    /// Default per-entry TTL in seconds
    pub default_ttl_secs: u64,
    /// Background sweep interval in seconds
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

/// One rate-limit rule: `requests` admitted per `window_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    pub requests: u32,
    pub window_ms: u64,
}

impl LimitRule {
    pub const fn new(requests: u32, window_ms: u64) -> Self {
        Self { requests, window_ms }
    }
}

/// Per-tier, per-endpoint-class rate-limit table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub limits: HashMap<Tier, HashMap<EndpointClass, LimitRule>>,
    /// Evict in-memory buckets untouched for this long
    pub bucket_idle_secs: u64,
    /// Idle-bucket sweep interval in seconds
    pub sweep_interval_secs: u64,
}

impl RateLimitConfig {
    /// Rule for a (tier, class) pair; missing entries fall back to the
    /// most conservative tier, then to a hard floor.
    pub fn rule_for(&self, tier: Tier, class: EndpointClass) -> LimitRule {
        if let Some(rule) = self.limits.get(&tier).and_then(|t| t.get(&class)) {
            return *rule;
        }
        if let Some(rule) = self
            .limits
            .get(&Tier::most_conservative())
            .and_then(|t| t.get(&class))
        {
            return *rule;
        }
        LimitRule::new(10, 60_000)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut limits = HashMap::new();

        let tier_table = |events, analytics, export, admin| {
            let mut t = HashMap::new();
            t.insert(EndpointClass::Events, LimitRule::new(events, 60_000));
            t.insert(EndpointClass::Analytics, LimitRule::new(analytics, 60_000));
            t.insert(EndpointClass::Export, LimitRule::new(export, 60_000));
            t.insert(EndpointClass::Admin, LimitRule::new(admin, 60_000));
            t
        };

        limits.insert(Tier::Free, tier_table(100, 50, 5, 30));
        limits.insert(Tier::Starter, tier_table(1_000, 300, 20, 60));
        limits.insert(Tier::Pro, tier_table(10_000, 2_000, 100, 120));
        limits.insert(Tier::Enterprise, tier_table(100_000, 20_000, 500, 300));

        Self {
            limits,
            bucket_idle_secs: 900,
            sweep_interval_secs: 60,
        }
    }
}

/// Distributed rate-limit backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub enabled: bool,
    pub url: String,
    /// Sliding-window keys are `<key_prefix><tenant>:<class>`
    pub key_prefix: String,
    /// Per-call timeout; on expiry the call degrades to in-memory mode
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "funnel:rl:".to_string(),
            timeout_ms: 200,
        }
    }
}

/// Key material for one field category
#[derive(Clone, Serialize, Deserialize)]
pub struct FieldKeyConfig {
    /// Hex-encoded 256-bit AES keys by version
    pub keys: HashMap<u32, String>,
    /// Hex-encoded HMAC secret for fingerprints
    pub fingerprint_secret: String,
}

// Key material must never reach logs, including via Debug formatting.
impl std::fmt::Debug for FieldKeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldKeyConfig")
            .field("keys", &format_args!("<{} version(s)>", self.keys.len()))
            .field("fingerprint_secret", &"<redacted>")
            .finish()
    }
}

/// PII encryption configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Key version used for new encryptions
    pub active_version: u32,
    /// Per-category key material, keyed by category label ("email", "phone")
    pub fields: HashMap<String, FieldKeyConfig>,
}

/// Credential-validation cache tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthCacheConfig {
    /// TTL for successfully resolved credentials
    pub positive_ttl_secs: u64,
    /// TTL for rejected credentials (kept short so an operator fixing a
    /// key is not stuck behind a stale negative entry)
    pub negative_ttl_secs: u64,
}

impl Default for AuthCacheConfig {
    fn default() -> Self {
        Self {
            positive_ttl_secs: 300,
            negative_ttl_secs: 30,
        }
    }
}
