//! Control plane workflow: the registry, resolver, provisioner and
//! coordinator wired together, plus the create/onboard sequence.

use crate::cache::ResolverCache;
use crate::coordinator::{MigrationCoordinator, MigrationReport};
use crate::crypto::SecretCipher;
use crate::error::TenantError;
use crate::migration::{MigrationCatalog, MigrationExecutor};
use crate::provisioner::DatabaseProvisioner;
use crate::registry::TenantRegistry;
use crate::resolver::{ResolvedTenant, SubdomainResolver};
use crate::storage::StorageProvisioner;
use crate::store::TenantStore;
use crate::tenant::{ConnectionDescriptor, LifecycleState, Tenant, TenantId};
use std::sync::Arc;
use std::time::Duration;
use tenantry_events::RetryPolicy;
use tokio::sync::Notify;
use tracing::{error, info};

pub struct ControlPlane {
    registry: Arc<TenantRegistry>,
    resolver: Arc<SubdomainResolver>,
    provisioner: Arc<DatabaseProvisioner>,
    coordinator: Arc<MigrationCoordinator>,
    cipher: Arc<SecretCipher>,
    baseline_version: Option<u32>,
}

impl ControlPlane {
    pub fn builder() -> ControlPlaneBuilder {
        ControlPlaneBuilder::new()
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<SubdomainResolver> {
        &self.resolver
    }

    pub fn provisioner(&self) -> &Arc<DatabaseProvisioner> {
        &self.provisioner
    }

    pub fn coordinator(&self) -> &Arc<MigrationCoordinator> {
        &self.coordinator
    }

    /// Schema version every new tenant is brought to during onboarding.
    pub fn baseline(&self) -> u32 {
        let latest = self.coordinator.catalog().latest();
        self.baseline_version.map_or(latest, |v| v.min(latest))
    }

    /// Reserve the subdomain and onboard the tenant in the background.
    ///
    /// Returns the `pending` record as soon as the reservation commits. A
    /// caller that goes away afterwards does not stop onboarding, and the
    /// reconciliation sweep picks up anything left unfinished.
    pub async fn create_tenant(self: &Arc<Self>, name: &str, subdomain: &str) -> Result<Tenant, TenantError> {
        let tenant = self.registry.reserve(subdomain, name).await?;

        let control = Arc::clone(self);
        let id = tenant.id;
        tokio::spawn(async move {
            if let Err(err) = control.onboard(&id).await {
                error!(tenant_id = %id, code = err.code(), error = %err, "Onboarding did not complete");
            }
        });

        Ok(tenant)
    }

    /// Provision storage and bring the schema to the baseline.
    pub async fn onboard(&self, id: &TenantId) -> Result<Tenant, TenantError> {
        self.provisioner.provision_storage(id).await?;

        let tenant = self.registry.get(id).await?;
        if tenant.state == LifecycleState::Provisioned {
            let report = self.coordinator.migrate(id, Some(self.baseline())).await?;
            if let Some(step) = report.failed_step {
                return Err(TenantError::Migration {
                    tenant_id: *id,
                    step,
                    message: report.error.unwrap_or_default(),
                });
            }
            info!(tenant_id = %id, version = report.version, "Tenant onboarded");
        }
        self.registry.get(id).await
    }

    pub async fn get(&self, id: &TenantId) -> Result<Tenant, TenantError> {
        self.registry.get(id).await
    }

    /// Cached lookup by subdomain, returning inactive tenants too.
    pub async fn get_by_subdomain(&self, subdomain: &str) -> Result<Tenant, TenantError> {
        self.resolver.lookup(subdomain).await
    }

    pub async fn resolve(&self, subdomain: &str) -> Result<ResolvedTenant, TenantError> {
        self.resolver.resolve(subdomain).await
    }

    /// Decrypted connection descriptor for authorized internal callers.
    pub async fn database(&self, id: &TenantId) -> Result<ConnectionDescriptor, TenantError> {
        let tenant = self.registry.get(id).await?;
        match tenant.storage {
            Some(ref storage) => storage.unseal(&self.cipher),
            None => Err(TenantError::NotReady {
                tenant_id: *id,
                state: tenant.state,
            }),
        }
    }

    pub async fn migrate(&self, id: &TenantId, target: Option<u32>) -> Result<MigrationReport, TenantError> {
        self.coordinator.migrate(id, target).await
    }

    pub async fn deactivate(&self, id: &TenantId) -> Result<Tenant, TenantError> {
        self.registry.deactivate(id).await
    }

    pub async fn reactivate(&self, id: &TenantId) -> Result<Tenant, TenantError> {
        self.registry.reactivate(id).await
    }

    pub async fn release_subdomain(&self, id: &TenantId) -> Result<Tenant, TenantError> {
        self.registry.release_subdomain(id).await
    }
}

/// Assembles a [`ControlPlane`] from its backends.
pub struct ControlPlaneBuilder {
    store: Option<Arc<dyn TenantStore>>,
    storage: Option<Arc<dyn StorageProvisioner>>,
    executor: Option<Arc<dyn MigrationExecutor>>,
    cipher: Option<Arc<SecretCipher>>,
    catalog: MigrationCatalog,
    baseline_version: Option<u32>,
    cache_ttl: Duration,
    retry: RetryPolicy,
    lease_ttl: Duration,
    workers: usize,
    base_domain: Option<String>,
    outbox_signal: Option<Arc<Notify>>,
}

impl ControlPlaneBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            storage: None,
            executor: None,
            cipher: None,
            catalog: MigrationCatalog::default(),
            baseline_version: None,
            cache_ttl: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            lease_ttl: Duration::from_secs(300),
            workers: 8,
            base_domain: None,
            outbox_signal: None,
        }
    }

    /// Authoritative tenant store.
    pub fn store(mut self, store: Arc<dyn TenantStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Engine that hosts tenant databases.
    pub fn storage(mut self, storage: Arc<dyn StorageProvisioner>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn MigrationExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn cipher(mut self, cipher: Arc<SecretCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn catalog(mut self, catalog: MigrationCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Onboarding target; the latest catalog version when unset.
    pub fn baseline_version(mut self, version: Option<u32>) -> Self {
        self.baseline_version = version;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn base_domain(mut self, base_domain: Option<String>) -> Self {
        self.base_domain = base_domain;
        self
    }

    /// Signal raised after every write that produced events.
    pub fn outbox_signal(mut self, signal: Arc<Notify>) -> Self {
        self.outbox_signal = Some(signal);
        self
    }

    pub fn build(self) -> Result<ControlPlane, TenantError> {
        let store = self.store.ok_or_else(|| missing("store"))?;
        let storage = self.storage.ok_or_else(|| missing("storage provisioner"))?;
        let executor = self.executor.ok_or_else(|| missing("migration executor"))?;
        let cipher = self.cipher.ok_or_else(|| missing("secret cipher"))?;

        let cache = Arc::new(ResolverCache::new(self.cache_ttl));
        let mut registry = TenantRegistry::new(store.clone(), cache.clone());
        if let Some(signal) = self.outbox_signal {
            registry = registry.with_outbox_signal(signal);
        }
        let registry = Arc::new(registry);

        let mut resolver = SubdomainResolver::new(store, cache, cipher.clone());
        if let Some(base_domain) = self.base_domain {
            resolver = resolver.with_base_domain(base_domain);
        }

        let provisioner = DatabaseProvisioner::new(registry.clone(), storage, cipher.clone())
            .with_retry(self.retry.clone())
            .with_lease_ttl(self.lease_ttl);
        let coordinator = MigrationCoordinator::new(registry.clone(), executor, cipher.clone(), Arc::new(self.catalog))
            .with_retry(self.retry)
            .with_lease_ttl(self.lease_ttl)
            .with_workers(self.workers);

        Ok(ControlPlane {
            registry,
            resolver: Arc::new(resolver),
            provisioner: Arc::new(provisioner),
            coordinator: Arc::new(coordinator),
            cipher,
            baseline_version: self.baseline_version,
        })
    }
}

impl Default for ControlPlaneBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn missing(what: &str) -> TenantError {
    TenantError::Validation(format!("control plane requires a {}", what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationStep;
    use crate::storage::InMemoryEngine;
    use crate::store::InMemoryTenantStore;
    use crate::tenant::TenantStatus;

    fn control_plane(baseline: Option<u32>) -> (Arc<ControlPlane>, Arc<InMemoryEngine>) {
        let engine = Arc::new(InMemoryEngine::default());
        let catalog = MigrationCatalog::new(
            (1..=3)
                .map(|v| MigrationStep::new(v, format!("step_{}", v), format!("SELECT {};", v)))
                .collect(),
        )
        .unwrap();
        let control = ControlPlane::builder()
            .store(Arc::new(InMemoryTenantStore::new()))
            .storage(engine.clone())
            .executor(engine.clone())
            .cipher(Arc::new(SecretCipher::ephemeral()))
            .catalog(catalog)
            .baseline_version(baseline)
            .retry(RetryPolicy::immediate(3))
            .build()
            .unwrap();
        (Arc::new(control), engine)
    }

    async fn wait_for(control: &ControlPlane, id: &TenantId, state: LifecycleState) -> Tenant {
        for _ in 0..200 {
            let tenant = control.get(id).await.unwrap();
            if tenant.state == state {
                return tenant;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("tenant {} never reached {}", id, state);
    }

    #[test]
    fn test_build_requires_backends() {
        assert!(ControlPlane::builder().build().is_err());
    }

    #[tokio::test]
    async fn test_onboard_reaches_baseline() {
        let (control, _) = control_plane(Some(1));
        let tenant = control.registry().reserve("acme", "Acme").await.unwrap();

        let onboarded = control.onboard(&tenant.id).await.unwrap();
        assert_eq!(onboarded.state, LifecycleState::Migrated);
        assert_eq!(onboarded.migration_version, 1);
        assert!(control.resolve("acme").await.is_ok());

        // onboarding again changes nothing
        assert_eq!(control.onboard(&tenant.id).await.unwrap().migration_version, 1);
    }

    #[tokio::test]
    async fn test_create_tenant_returns_pending_and_completes_in_background() {
        let (control, engine) = control_plane(None);
        let tenant = control.create_tenant("Acme", "acme").await.unwrap();
        assert_eq!(tenant.status(), TenantStatus::Pending);
        assert_eq!(tenant.migration_version, 0);

        let done = wait_for(&control, &tenant.id, LifecycleState::Migrated).await;
        assert_eq!(done.migration_version, 3);
        assert_eq!(engine.database_count(), 1);
    }

    #[tokio::test]
    async fn test_database_requires_storage() {
        let (control, _) = control_plane(Some(0));
        let tenant = control.registry().reserve("acme", "Acme").await.unwrap();
        assert!(matches!(
            control.database(&tenant.id).await,
            Err(TenantError::NotReady { .. })
        ));

        control.onboard(&tenant.id).await.unwrap();
        let conn = control.database(&tenant.id).await.unwrap();
        assert_eq!(conn.db_host, "localhost");
    }

    #[test]
    fn test_baseline_capped_at_latest() {
        let (control, _) = control_plane(Some(10));
        assert_eq!(control.baseline(), 3);
        let (control, _) = control_plane(None);
        assert_eq!(control.baseline(), 3);
    }
}
