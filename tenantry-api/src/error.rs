// API errors and their HTTP rendering

use crate::HttpResponse;
use serde::Serialize;
use tenantry_tenancy::TenantError;
use thiserror::Error;

/// Anything a handler can fail with.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Tenant(#[from] TenantError),

    /// Unparseable body or parameter.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Missing bearer token")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: &'a str,
    message: String,
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Tenant(err) => tenant_status(err),
            ApiError::BadRequest(_) => 400,
            ApiError::Unauthorized => 401,
            ApiError::Forbidden => 403,
            ApiError::RouteNotFound(_) => 404,
            ApiError::Internal(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Tenant(err) => err.code(),
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::RouteNotFound(_) => "ROUTE_NOT_FOUND",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// `{"error": {"code": ..., "message": ...}}` with the mapped status.
    pub fn into_response(self) -> HttpResponse {
        let status = self.status_code();
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: self.to_string(),
            },
        };
        HttpResponse::new(status)
            .with_json(&body)
            .unwrap_or_else(|_| HttpResponse::new(500))
    }
}

fn tenant_status(err: &TenantError) -> u16 {
    match err {
        TenantError::Validation(_) => 400,
        TenantError::NotFound(_) => 404,
        TenantError::Inactive(_) => 403,
        TenantError::SubdomainTaken(_)
        | TenantError::NotReady { .. }
        | TenantError::InvalidTransition { .. }
        | TenantError::Conflict(_)
        | TenantError::MigrationInProgress(_) => 409,
        TenantError::TransientProvisioning(_) | TenantError::Store(_) => 503,
        TenantError::PermanentProvisioning(_)
        | TenantError::Migration { .. }
        | TenantError::ChecksumMismatch { .. }
        | TenantError::Secret(_) => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenantry_tenancy::{LifecycleState, TenantId};

    #[test]
    fn test_tenant_error_statuses() {
        let id = TenantId::new();
        let cases = [
            (TenantError::Validation("bad".into()), 400),
            (TenantError::SubdomainTaken("beta".into()), 409),
            (TenantError::NotFound("ghost".into()), 404),
            (TenantError::Inactive("acme".into()), 403),
            (
                TenantError::NotReady {
                    tenant_id: id,
                    state: LifecycleState::Pending,
                },
                409,
            ),
            (TenantError::MigrationInProgress(id), 409),
            (TenantError::TransientProvisioning("timeout".into()), 503),
            (TenantError::PermanentProvisioning("quota".into()), 500),
            (TenantError::Store("down".into()), 503),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_error_body_shape() {
        let response = ApiError::from(TenantError::SubdomainTaken("beta".into())).into_response();
        assert_eq!(response.status, 409);

        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["error"]["code"], "SUBDOMAIN_TAKEN");
        assert!(body["error"]["message"].as_str().unwrap().contains("beta"));
    }
}
