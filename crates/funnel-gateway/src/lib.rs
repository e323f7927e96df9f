//! OpenFunnel Admission Pipeline
//!
//! Every inbound request passes credential validation, then rate
//! limiting, before any business logic runs. This crate wires the two
//! protective components together and exposes their counters for
//! scraping.

use funnel_auth::CredentialValidator;
use funnel_common::{EndpointClass, TenantId, Tier, WorkspaceId};
use funnel_ratelimit::RateLimiter;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;

/// A request cleared for business logic
#[derive(Debug, Clone)]
pub struct Admission {
    pub tenant_id: TenantId,
    pub workspace_id: Option<WorkspaceId>,
    pub scopes: Vec<String>,
    pub principal_id: Option<String>,
    pub tier: Tier,
    /// Quota left in the current window after this request
    pub remaining: u32,
}

/// Machine-readable denial
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDenial {
    /// Credential unknown, expired, or revoked
    InvalidCredential,
    /// Over quota for this endpoint class
    RateLimited { retry_after_secs: u64, limit: u32 },
}

/// Validator → limiter pipeline
pub struct AdmissionPipeline {
    validator: Arc<CredentialValidator>,
    limiter: Arc<RateLimiter>,
    registry: Registry,
}

impl AdmissionPipeline {
    pub fn new(validator: Arc<CredentialValidator>, limiter: Arc<RateLimiter>) -> Self {
        let registry = Registry::new();
        if let Err(err) = limiter.metrics().register(&registry) {
            tracing::warn!(error = %err, "failed to register rate-limit metrics");
        }
        Self {
            validator,
            limiter,
            registry,
        }
    }

    /// Run the full admission check for one request
    pub async fn admit(
        &self,
        raw_credential: &str,
        class: EndpointClass,
    ) -> Result<Admission, AdmissionDenial> {
        let outcome = self.validator.validate(raw_credential).await;
        if !outcome.is_valid {
            return Err(AdmissionDenial::InvalidCredential);
        }
        let tenant_id = outcome
            .tenant_id
            .ok_or(AdmissionDenial::InvalidCredential)?;

        let decision = self
            .limiter
            .check_limit(&tenant_id, class, outcome.tier)
            .await;
        if !decision.allowed {
            return Err(AdmissionDenial::RateLimited {
                retry_after_secs: decision.retry_after_secs.unwrap_or(1),
                limit: decision.limit,
            });
        }

        Ok(Admission {
            tenant_id,
            workspace_id: outcome.workspace_id,
            scopes: outcome.scopes,
            principal_id: outcome.principal_id,
            tier: outcome.tier,
            remaining: decision.remaining,
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn validator(&self) -> &Arc<CredentialValidator> {
        &self.validator
    }

    /// Prometheus text exposition of every registered counter
    pub fn metrics_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
