//! Tenant control plane for tenantry.
//!
//! Each tenant gets its own physical database, addressed by a subdomain.
//! This crate maps subdomains to those databases, creates them on demand
//! with scoped credentials, and moves each tenant's schema forward on its own.
//!
//! # Components
//!
//! - [`TenantRegistry`]: the only writer of tenant state, backed by a
//!   transactional [`TenantStore`]
//! - [`SubdomainResolver`]: cached read path from subdomain to
//!   [`ConnectionDescriptor`]
//! - [`DatabaseProvisioner`]: idempotent, single-flight creation of the
//!   database and role behind a [`StorageProvisioner`]
//! - [`MigrationCoordinator`]: per-tenant, lease-protected migration runs
//!   over a [`MigrationExecutor`]
//! - [`ControlPlane`]: the pieces wired together, with the onboarding
//!   workflow and [`ReconciliationSweep`]
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tenantry_tenancy::*;
//!
//! let engine = Arc::new(InMemoryEngine::default());
//! let control = Arc::new(
//!     ControlPlane::builder()
//!         .store(Arc::new(InMemoryTenantStore::new()))
//!         .storage(engine.clone())
//!         .executor(engine)
//!         .cipher(Arc::new(SecretCipher::ephemeral()))
//!         .catalog(MigrationCatalog::load_dir("migrations")?)
//!         .build()?,
//! );
//!
//! let tenant = control.create_tenant("Acme", "acme").await?;
//! // later, on the request path
//! let resolved = control.resolve("acme").await?;
//! ```
//!
//! # Feature Flags
//!
//! - `postgres`: [`postgres::PgTenantStore`], [`postgres::PgStorageProvisioner`]
//!   and [`postgres::PgMigrationExecutor`] through sea-orm

pub mod cache;
pub mod control;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod migration;
pub mod provisioner;
pub mod reconcile;
pub mod registry;
pub mod resolver;
pub mod storage;
pub mod store;
pub mod tenant;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use cache::ResolverCache;
pub use control::{ControlPlane, ControlPlaneBuilder};
pub use coordinator::{MigrationCoordinator, MigrationReport};
pub use crypto::{CryptoError, SealedSecret, SecretCipher};
pub use error::{StoreError, TenantError};
pub use migration::{AppliedStep, CatalogError, ExecError, MigrationCatalog, MigrationExecutor, MigrationStep};
pub use provisioner::{DatabaseProvisioner, ReconcileOutcome};
pub use reconcile::{ReconciliationSweep, SweepReport};
pub use registry::TenantRegistry;
pub use resolver::{ResolvedTenant, SubdomainResolver};
pub use storage::{EngineOp, InMemoryEngine, PhysicalNames, StorageError, StorageProvisioner};
pub use store::{InMemoryTenantStore, Lease, LeaseKind, TenantFilter, TenantStore};
pub use tenant::{
    ConnectionDescriptor, LifecycleState, MigrationFailure, MigrationStatus, StorageDescriptor, Subdomain, Tenant,
    TenantId, TenantStatus, Transition, TransitionOutcome,
};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::control::ControlPlane;
    pub use crate::error::TenantError;
    pub use crate::resolver::{ResolvedTenant, SubdomainResolver};
    pub use crate::tenant::{ConnectionDescriptor, LifecycleState, MigrationStatus, Tenant, TenantId, TenantStatus};
}
