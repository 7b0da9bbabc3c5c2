//! Migration Coordinator
//!
//! Advances one tenant's schema at a time through the catalog. A run holds
//! the tenant's migration lease for its whole duration; runs for different
//! tenants proceed in parallel, bounded by a worker pool. The tenant ledger
//! is the record of what actually committed, so a run that takes over from a
//! crashed worker first brings the registry up to the ledger and continues
//! from there.

use crate::crypto::SecretCipher;
use crate::error::TenantError;
use crate::migration::{AppliedStep, ExecError, MigrationCatalog, MigrationExecutor};
use crate::registry::TenantRegistry;
use crate::store::{Lease, LeaseKind, TenantFilter};
use crate::tenant::{ConnectionDescriptor, LifecycleState, MigrationStatus, Tenant, TenantId, Transition};
use std::sync::Arc;
use std::time::Duration;
use tenantry_events::RetryPolicy;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Result of a migration run that got as far as touching the tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationReport {
    pub tenant_id: TenantId,
    pub status: MigrationStatus,
    /// Last committed step.
    pub version: u32,
    pub target: u32,
    /// Steps applied by this run, in order.
    pub applied: Vec<u32>,
    pub failed_step: Option<u32>,
    pub error: Option<String>,
}

pub struct MigrationCoordinator {
    registry: Arc<TenantRegistry>,
    executor: Arc<dyn MigrationExecutor>,
    cipher: Arc<SecretCipher>,
    catalog: Arc<MigrationCatalog>,
    workers: Arc<Semaphore>,
    retry: RetryPolicy,
    lease_ttl: Duration,
    holder: String,
}

impl MigrationCoordinator {
    pub fn new(
        registry: Arc<TenantRegistry>,
        executor: Arc<dyn MigrationExecutor>,
        cipher: Arc<SecretCipher>,
        catalog: Arc<MigrationCatalog>,
    ) -> Self {
        Self {
            registry,
            executor,
            cipher,
            catalog,
            workers: Arc::new(Semaphore::new(8)),
            retry: RetryPolicy::default(),
            lease_ttl: Duration::from_secs(300),
            holder: format!("coordinator-{}", uuid::Uuid::new_v4().simple()),
        }
    }

    /// Maximum number of tenants migrated at once.
    pub fn with_workers(mut self, size: usize) -> Self {
        self.workers = Arc::new(Semaphore::new(size.max(1)));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn catalog(&self) -> &MigrationCatalog {
        &self.catalog
    }

    /// Migrate a tenant to `target`, or to the latest catalog version.
    ///
    /// A failing step is reported through the returned report, with the
    /// tenant marked failed. Errors are reserved for runs that could not
    /// start or could not read the tenant's ledger.
    pub async fn migrate(&self, id: &TenantId, target: Option<u32>) -> Result<MigrationReport, TenantError> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| TenantError::Store("migration worker pool closed".to_string()))?;

        let tenant = self.registry.get(id).await?;
        if !tenant.is_active {
            return Err(TenantError::Inactive(id.to_string()));
        }
        if tenant.storage.is_none() {
            return Err(TenantError::NotReady {
                tenant_id: *id,
                state: tenant.state,
            });
        }

        let latest = self.catalog.latest();
        let target = target.unwrap_or(latest);
        if target > latest {
            return Err(TenantError::Validation(format!(
                "target version {} is beyond the latest migration {}",
                target, latest
            )));
        }
        if target < tenant.migration_version {
            return Err(TenantError::Validation(format!(
                "target version {} is below current version {}",
                target, tenant.migration_version
            )));
        }

        let Some(lease) = self
            .registry
            .try_lease(id, LeaseKind::Migration, &self.holder, self.lease_ttl)
            .await?
        else {
            return Err(TenantError::MigrationInProgress(*id));
        };

        let result = self.migrate_leased(tenant, target, &lease).await;
        self.registry.release_lease(&lease).await;
        result
    }

    async fn migrate_leased(&self, tenant: Tenant, target: u32, lease: &Lease) -> Result<MigrationReport, TenantError> {
        let id = tenant.id;
        let conn = match tenant.storage {
            Some(ref storage) => storage.unseal(&self.cipher)?,
            None => {
                return Err(TenantError::NotReady {
                    tenant_id: id,
                    state: tenant.state,
                });
            }
        };

        let committed = self.verified_ledger(&id, &conn).await?;
        if committed < tenant.migration_version {
            return Err(TenantError::Migration {
                tenant_id: id,
                step: committed + 1,
                message: format!(
                    "ledger holds {} steps but the registry records version {}",
                    committed, tenant.migration_version
                ),
            });
        }

        let tenant = self
            .registry
            .update_state(&id, Transition::MigrationStarted { target: target.max(committed) })
            .await?;

        match self.run_started(tenant, target, lease, &conn, committed).await {
            Ok(report) => Ok(report),
            Err(err) => {
                self.abandon(&id, &err).await;
                Err(err)
            }
        }
    }

    /// Body of a run after it was marked in progress.
    async fn run_started(
        &self,
        mut tenant: Tenant,
        target: u32,
        lease: &Lease,
        conn: &ConnectionDescriptor,
        committed: u32,
    ) -> Result<MigrationReport, TenantError> {
        let id = tenant.id;
        if committed > tenant.migration_version {
            info!(
                tenant_id = %id,
                from = tenant.migration_version,
                to = committed,
                "Resuming from ledger"
            );
            for version in tenant.migration_version + 1..=committed {
                tenant = self
                    .registry
                    .update_state(&id, Transition::MigrationStepApplied { version })
                    .await?;
            }
        }

        let mut applied = Vec::new();
        for step in self.catalog.pending(tenant.migration_version, target) {
            self.renew_lease(lease).await?;

            let executor = &self.executor;
            let conn_ref = conn;
            let result = self
                .retry
                .run("apply_migration", ExecError::is_transient, move || async move {
                    executor.apply_step(conn_ref, step).await
                })
                .await;

            match result {
                Ok(row) => {
                    tenant = self
                        .registry
                        .update_state(&id, Transition::MigrationStepApplied { version: row.version })
                        .await?;
                    applied.push(row.version);
                    debug!(tenant_id = %id, version = row.version, name = %row.name, "Migration step applied");
                }
                Err(err) => {
                    let message = err.to_string();
                    error!(tenant_id = %id, version = step.version, error = %message, "Migration step failed");
                    tenant = self
                        .registry
                        .update_state(
                            &id,
                            Transition::MigrationFailed {
                                step: step.version,
                                message: message.clone(),
                            },
                        )
                        .await?;
                    return Ok(MigrationReport {
                        tenant_id: id,
                        status: tenant.migration_status,
                        version: tenant.migration_version,
                        target,
                        applied,
                        failed_step: Some(step.version),
                        error: Some(message),
                    });
                }
            }
        }

        let tenant = self
            .registry
            .update_state(
                &id,
                Transition::MigrationCompleted {
                    version: tenant.migration_version,
                },
            )
            .await?;
        info!(tenant_id = %id, version = tenant.migration_version, applied = applied.len(), "Migration complete");

        Ok(MigrationReport {
            tenant_id: id,
            status: tenant.migration_status,
            version: tenant.migration_version,
            target,
            applied,
            failed_step: None,
            error: None,
        })
    }

    /// Close out a run that stopped without reaching a verdict so the tenant
    /// is not left in progress. A lost lease belongs to the new holder.
    async fn abandon(&self, id: &TenantId, err: &TenantError) {
        if matches!(err, TenantError::MigrationInProgress(_)) {
            return;
        }
        let recorded = match self.registry.get(id).await {
            Ok(tenant) if tenant.migration_status == MigrationStatus::InProgress => {
                self.registry
                    .update_state(
                        id,
                        Transition::MigrationFailed {
                            step: tenant.migration_version + 1,
                            message: err.to_string(),
                        },
                    )
                    .await
                    .map(|_| ())
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        match recorded {
            Ok(()) => error!(tenant_id = %id, error = %err, "Migration run aborted"),
            // status stays in progress; the reconciliation sweep resumes it once the lease expires
            Err(e) => warn!(tenant_id = %id, error = %e, "Could not record aborted migration run"),
        }
    }

    /// Read the ledger and check it against the catalog. Returns the last
    /// committed version.
    async fn verified_ledger(&self, id: &TenantId, conn: &ConnectionDescriptor) -> Result<u32, TenantError> {
        let executor = &self.executor;
        let rows: Vec<AppliedStep> = self
            .retry
            .run("read_ledger", ExecError::is_transient, move || async move {
                executor.applied_steps(conn).await
            })
            .await
            .map_err(|e| TenantError::Store(e.to_string()))?;

        for (index, row) in rows.iter().enumerate() {
            let expected = index as u32 + 1;
            let matches = row.version == expected
                && self
                    .catalog
                    .step(row.version)
                    .is_some_and(|step| step.checksum == row.checksum);
            if !matches {
                error!(tenant_id = %id, version = row.version, "Applied migration does not match the catalog");
                return Err(TenantError::ChecksumMismatch {
                    tenant_id: *id,
                    version: row.version,
                });
            }
        }
        Ok(rows.len() as u32)
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<(), TenantError> {
        let renewed = self
            .registry
            .try_lease(&lease.tenant_id, lease.kind, &lease.holder, self.lease_ttl)
            .await?;
        if renewed.is_none() {
            warn!(tenant_id = %lease.tenant_id, "Migration lease lost to another worker");
            return Err(TenantError::MigrationInProgress(lease.tenant_id));
        }
        Ok(())
    }

    /// Migrate every tenant that has storage, concurrently. One tenant's
    /// failure has no effect on the others.
    pub async fn migrate_all(
        self: &Arc<Self>,
        target: Option<u32>,
    ) -> Result<Vec<(TenantId, Result<MigrationReport, TenantError>)>, TenantError> {
        let filter = TenantFilter::in_states(&[
            LifecycleState::Provisioned,
            LifecycleState::Migrated,
            LifecycleState::Failed,
        ])
        .active_only();
        let tenants = self.registry.list(&filter).await?;

        let mut tasks = JoinSet::new();
        for tenant in tenants.into_iter().filter(Tenant::is_provisioned) {
            let coordinator = Arc::clone(self);
            tasks.spawn(async move {
                let result = coordinator.migrate(&tenant.id, target).await;
                (tenant.id, result)
            });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => error!(error = %err, "Migration task panicked"),
            }
        }
        results.sort_by_key(|(id, _)| *id);
        Ok(results)
    }
}
