//! HTTP control API for tenantry.
//!
//! A small hyper server in front of [`ControlPlane`](tenantry_tenancy::ControlPlane):
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /tenants` | reserve a subdomain, onboarding continues in the background |
//! | `GET /tenants/:id` | tenant record, never with credentials |
//! | `GET /tenants/by-subdomain/:subdomain` | lookup, inactive tenants included |
//! | `GET /tenants/:id/database` | connection descriptor, bearer token required |
//! | `POST /tenants/:id/migrations` | run or continue a migration |
//! | `GET /resolve/:subdomain` | gateway resolution |
//!
//! plus `deactivate`, `reactivate`, `release-subdomain` and
//! `retry-provisioning` actions under `/tenants/:id/`.
//!
//! Errors are rendered as `{"error": {"code": "...", "message": "..."}}`
//! with the status derived from the error code.
//!
//! ```rust,ignore
//! let config = ControlPlaneConfig::load(None)?;
//! tenantry_api::run(config).await?;
//! ```

pub mod bootstrap;
pub mod dto;
pub mod error;
pub mod handlers;
pub mod http;
pub mod routing;
pub mod server;

pub use bootstrap::{Runtime, StartupError, build, run};
pub use error::ApiError;
pub use handlers::{ApiState, router};
pub use http::{HttpRequest, HttpResponse};
pub use routing::{HandlerFn, Route, Router};
pub use server::Server;
