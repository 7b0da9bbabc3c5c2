//! Error taxonomy of the control plane.

use crate::tenant::{LifecycleState, TenantId};
use thiserror::Error;

/// Errors surfaced by the registry, resolver, provisioner and coordinator.
///
/// Each variant maps to a stable [`code`](TenantError::code) that callers can
/// match on without parsing messages.
#[derive(Debug, Clone, Error)]
pub enum TenantError {
    /// Malformed input; never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Subdomain already taken: {0}")]
    SubdomainTaken(String),

    #[error("Tenant not found: {0}")]
    NotFound(String),

    #[error("Tenant is inactive: {0}")]
    Inactive(String),

    /// Storage is not provisioned or the baseline schema is not in place yet.
    #[error("Tenant {tenant_id} is not ready ({state})")]
    NotReady {
        tenant_id: TenantId,
        state: LifecycleState,
    },

    #[error("Transition {transition} not allowed for tenant {tenant_id} in state {state}")]
    InvalidTransition {
        tenant_id: TenantId,
        state: LifecycleState,
        transition: &'static str,
    },

    /// Optimistic concurrency retries exhausted.
    #[error("Concurrent modification of tenant {0}")]
    Conflict(TenantId),

    #[error("A migration is already running for tenant {0}")]
    MigrationInProgress(TenantId),

    /// Connectivity or timeouts against the storage engine, after retries.
    #[error("Provisioning temporarily unavailable: {0}")]
    TransientProvisioning(String),

    /// Quota exceeded, unrecoverable naming conflict and the like.
    #[error("Provisioning failed: {0}")]
    PermanentProvisioning(String),

    #[error("Migration step {step} failed for tenant {tenant_id}: {message}")]
    Migration {
        tenant_id: TenantId,
        step: u32,
        message: String,
    },

    /// An applied step no longer matches the catalog.
    #[error("Checksum mismatch for migration {version} of tenant {tenant_id}")]
    ChecksumMismatch { tenant_id: TenantId, version: u32 },

    #[error("Secret handling failed: {0}")]
    Secret(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl TenantError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            TenantError::Validation(_) => "VALIDATION_ERROR",
            TenantError::SubdomainTaken(_) => "SUBDOMAIN_TAKEN",
            TenantError::NotFound(_) => "TENANT_NOT_FOUND",
            TenantError::Inactive(_) => "TENANT_INACTIVE",
            TenantError::NotReady { .. } => "TENANT_NOT_READY",
            TenantError::InvalidTransition { .. } => "INVALID_STATE_TRANSITION",
            TenantError::Conflict(_) => "CONCURRENT_MODIFICATION",
            TenantError::MigrationInProgress(_) => "MIGRATION_IN_PROGRESS",
            TenantError::TransientProvisioning(_) => "PROVISIONING_UNAVAILABLE",
            TenantError::PermanentProvisioning(_) => "PROVISIONING_FAILED",
            TenantError::Migration { .. } => "MIGRATION_FAILED",
            TenantError::ChecksumMismatch { .. } => "MIGRATION_CHECKSUM_MISMATCH",
            TenantError::Secret(_) => "SECRET_ERROR",
            TenantError::Store(_) => "STORE_ERROR",
        }
    }

    /// Whether the same call may succeed later without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TenantError::TransientProvisioning(_)
                | TenantError::Conflict(_)
                | TenantError::MigrationInProgress(_)
                | TenantError::Store(_)
        )
    }
}

/// Failures of the authoritative store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Uniqueness constraint violated.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Revision check failed.
    #[error("Revision conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for TenantError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists(subdomain) => TenantError::SubdomainTaken(subdomain),
            StoreError::NotFound(id) => TenantError::NotFound(id),
            other => TenantError::Store(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(TenantError::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(TenantError::SubdomainTaken("acme".into()).code(), "SUBDOMAIN_TAKEN");
        assert_eq!(TenantError::Inactive("acme".into()).code(), "TENANT_INACTIVE");
        assert_eq!(TenantError::NotFound("ghost".into()).code(), "TENANT_NOT_FOUND");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(TenantError::TransientProvisioning("timeout".into()).is_retryable());
        assert!(!TenantError::PermanentProvisioning("quota".into()).is_retryable());
        assert!(!TenantError::Validation("bad".into()).is_retryable());
    }

    #[test]
    fn test_store_error_mapping() {
        let err: TenantError = StoreError::AlreadyExists("beta".into()).into();
        assert!(matches!(err, TenantError::SubdomainTaken(ref s) if s == "beta"));

        let err: TenantError = StoreError::Backend("connection reset".into()).into();
        assert_eq!(err.code(), "STORE_ERROR");
    }
}
