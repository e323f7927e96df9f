//! Identity store implementations
//!
//! The in-memory store backs tests and single-node bootstrap; the JWT
//! store verifies tokens minted by an external, trusted identity
//! provider. Issuance never happens here.

use crate::{AuthError, CredentialContext, CredentialValidator, IdentityStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use funnel_common::Tier;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Credential registry held in process memory
pub struct InMemoryIdentityStore {
    credentials: DashMap<String, CredentialContext>,
    last_used: DashMap<String, DateTime<Utc>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self {
            credentials: DashMap::new(),
            last_used: DashMap::new(),
        }
    }

    /// Register a credential
    pub fn insert(&self, raw: &str, ctx: CredentialContext) {
        self.credentials.insert(raw.to_string(), ctx);
    }

    /// Last-used instant recorded for a principal, if any
    pub fn last_used(&self, principal_id: &str) -> Option<DateTime<Utc>> {
        self.last_used.get(principal_id).map(|e| *e.value())
    }
}

impl Default for InMemoryIdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn resolve(&self, raw: &str) -> Result<Option<CredentialContext>, AuthError> {
        Ok(self.credentials.get(raw).map(|e| e.value().clone()))
    }

    async fn revoke(&self, raw: &str) -> Result<(), AuthError> {
        self.credentials.remove(raw);
        Ok(())
    }

    async fn note_usage(&self, principal_id: &str) {
        self.last_used.insert(principal_id.to_string(), Utc::now());
    }
}

/// Claims expected in externally issued access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub tier: Option<String>,
}

/// Verifier for tokens issued by the external identity provider
pub struct JwtIdentityStore {
    decoding_key: DecodingKey,
    validation: Validation,
    // Revoked tokens by credential hash; consulted before signature checks
    revoked: DashMap<String, ()>,
}

impl JwtIdentityStore {
    pub fn new(secret: &[u8], issuer: &str, audience: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.leeway = 0;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            revoked: DashMap::new(),
        }
    }
}

#[async_trait]
impl IdentityStore for JwtIdentityStore {
    async fn resolve(&self, raw: &str) -> Result<Option<CredentialContext>, AuthError> {
        if self.revoked.contains_key(&CredentialValidator::cache_key(raw)) {
            return Ok(None);
        }

        // A token that fails verification is an invalid credential, not a
        // backend failure.
        let claims = match decode::<Claims>(raw, &self.decoding_key, &self.validation) {
            Ok(data) => data.claims,
            Err(_) => return Ok(None),
        };

        let tenant_id = match claims.tenant_id {
            Some(t) if !t.is_empty() => t,
            _ => return Ok(None),
        };

        Ok(Some(CredentialContext {
            tenant_id,
            workspace_id: claims.workspace_id,
            scopes: claims.scopes,
            principal_id: claims.sub,
            tier: Tier::from_label(claims.tier.as_deref().unwrap_or("")),
            valid_until: DateTime::from_timestamp(claims.exp, 0).unwrap_or_else(Utc::now),
        }))
    }

    async fn revoke(&self, raw: &str) -> Result<(), AuthError> {
        self.revoked.insert(CredentialValidator::cache_key(raw), ());
        Ok(())
    }
}
