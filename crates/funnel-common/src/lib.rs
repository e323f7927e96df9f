//! OpenFunnel Common - Shared types for the ingestion platform core
//!
//! Tenancy identifiers, subscription tiers, endpoint classes, and the
//! static configuration surface read once at process start.

use serde::{Deserialize, Serialize};

pub mod config;

pub use config::{
    AuthCacheConfig, CacheConfig, ConfigError, CoreConfig, CryptoConfig, FieldKeyConfig,
    LimitRule, RateLimitConfig, RedisConfig,
};

/// Tenant ID (assigned by the identity provider, opaque to the core)
pub type TenantId = String;

/// Workspace ID within a tenant
pub type WorkspaceId = String;

/// Subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl Tier {
    /// Most conservative tier, used when a credential carries an unknown tier
    pub const fn most_conservative() -> Self {
        Tier::Free
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Starter => "starter",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Parse a tier label; unknown labels map to the most conservative tier
    pub fn from_label(label: &str) -> Self {
        match label {
            "free" => Tier::Free,
            "starter" => Tier::Starter,
            "pro" => Tier::Pro,
            "enterprise" => Tier::Enterprise,
            _ => Tier::most_conservative(),
        }
    }
}

/// Endpoint class used for rate-limit partitioning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointClass {
    /// Event ingestion
    Events,
    /// Analytics reads
    Analytics,
    /// Bulk exports
    Export,
    /// Tenant administration
    Admin,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Events => "events",
            EndpointClass::Analytics => "analytics",
            EndpointClass::Export => "export",
            EndpointClass::Admin => "admin",
        }
    }

    pub const ALL: [EndpointClass; 4] = [
        EndpointClass::Events,
        EndpointClass::Analytics,
        EndpointClass::Export,
        EndpointClass::Admin,
    ];
}

impl std::fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
