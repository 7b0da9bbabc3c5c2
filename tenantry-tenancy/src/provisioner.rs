//! Database Provisioner
//!
//! Creates the physical database and the scoped role for a tenant, verifies
//! them with the tenant's own credentials, and hands the sealed descriptor to
//! the registry. Safe to call any number of times: concurrent callers in this
//! process share one run through a per-tenant mutex, other instances are kept
//! out by a provisioning lease in the store, and a tenant that already has
//! storage gets its existing descriptor back.

use crate::crypto::SecretCipher;
use crate::error::TenantError;
use crate::registry::TenantRegistry;
use crate::storage::{PhysicalNames, StorageError, StorageProvisioner};
use crate::store::LeaseKind;
use crate::tenant::{ConnectionDescriptor, LifecycleState, StorageDescriptor, TenantId, Transition};
use dashmap::DashMap;
use rand::Rng;
use rand::distr::Alphanumeric;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tenantry_events::RetryPolicy;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const PASSWORD_LEN: usize = 32;

/// What [`DatabaseProvisioner::reconcile`] found and did.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Storage recorded and present on the engine.
    Healthy,
    /// A pending tenant was provisioned.
    Provisioned,
    /// Leftovers of a failed provisioning attempt were dropped.
    RolledBack { role: bool, database: bool },
    /// Recorded storage is missing on the engine; needs an operator.
    Missing { role: bool, database: bool },
    /// Nothing to do for this tenant.
    Skipped,
}

pub struct DatabaseProvisioner {
    registry: Arc<TenantRegistry>,
    engine: Arc<dyn StorageProvisioner>,
    cipher: Arc<SecretCipher>,
    retry: RetryPolicy,
    lease_ttl: Duration,
    holder: String,
    inflight: DashMap<TenantId, Arc<Mutex<()>>>,
}

impl DatabaseProvisioner {
    pub fn new(registry: Arc<TenantRegistry>, engine: Arc<dyn StorageProvisioner>, cipher: Arc<SecretCipher>) -> Self {
        Self {
            registry,
            engine,
            cipher,
            retry: RetryPolicy::default(),
            lease_ttl: Duration::from_secs(300),
            holder: format!("provisioner-{}", uuid::Uuid::new_v4().simple()),
            inflight: DashMap::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Lease holder name; defaults to a random per-instance id.
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Provision storage for a tenant and return its connection descriptor.
    pub async fn provision(&self, id: &TenantId) -> Result<ConnectionDescriptor, TenantError> {
        let storage = self.provision_storage(id).await?;
        storage.unseal(&self.cipher)
    }

    /// Like [`provision`](Self::provision) but returns the sealed form.
    pub async fn provision_storage(&self, id: &TenantId) -> Result<StorageDescriptor, TenantError> {
        let lock = self.inflight.entry(*id).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            self.provision_locked(id).await
        };
        drop(lock);
        self.inflight.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn provision_locked(&self, id: &TenantId) -> Result<StorageDescriptor, TenantError> {
        if let Some(storage) = self.provisionable(id).await? {
            return Ok(storage);
        }

        let Some(lease) = self
            .registry
            .try_lease(id, LeaseKind::Provisioning, &self.holder, self.lease_ttl)
            .await?
        else {
            return Err(TenantError::TransientProvisioning(format!(
                "provisioning of tenant {} is held by another worker",
                id
            )));
        };

        // Another instance may have finished between the first read and the lease.
        let result = match self.provisionable(id).await {
            Ok(Some(storage)) => Ok(storage),
            Ok(None) => self.provision_leased(id).await,
            Err(err) => Err(err),
        };
        self.registry.release_lease(&lease).await;
        result
    }

    /// `Some` when storage is already recorded, `None` when the tenant is
    /// pending and active.
    async fn provisionable(&self, id: &TenantId) -> Result<Option<StorageDescriptor>, TenantError> {
        let tenant = self.registry.get(id).await?;
        if let Some(storage) = tenant.storage {
            debug!(tenant_id = %id, "Already provisioned");
            return Ok(Some(storage));
        }
        if !tenant.is_active {
            return Err(TenantError::Inactive(id.to_string()));
        }
        if tenant.state != LifecycleState::Pending {
            return Err(TenantError::InvalidTransition {
                tenant_id: *id,
                state: tenant.state,
                transition: "provision",
            });
        }
        Ok(None)
    }

    async fn provision_leased(&self, id: &TenantId) -> Result<StorageDescriptor, TenantError> {
        info!(tenant_id = %id, engine = self.engine.engine(), "Provisioning tenant database");

        match self.create_resources(id).await {
            Ok(storage) => self.record_provisioned(id, storage).await,
            Err(TenantError::PermanentProvisioning(reason)) => {
                error!(tenant_id = %id, reason = %reason, "Provisioning failed permanently");
                self.registry
                    .update_state(id, Transition::ProvisioningFailed { reason: reason.clone() })
                    .await?;
                Err(TenantError::PermanentProvisioning(reason))
            }
            Err(err) => {
                warn!(tenant_id = %id, error = %err, "Provisioning incomplete, tenant stays pending");
                Err(err)
            }
        }
    }

    async fn create_resources(&self, id: &TenantId) -> Result<StorageDescriptor, TenantError> {
        let names = PhysicalNames::for_tenant(id);
        let password = generate_password();
        let (db_host, db_port) = self.engine.endpoint();

        let engine = &self.engine;
        let role = names.role.as_str();
        let database = names.database.as_str();
        let secret = &password;

        // A leftover role from an interrupted run gets a fresh password; the
        // old one was never recorded.
        self.retry
            .run("create_role", StorageError::is_transient, move || async move {
                if engine.role_exists(role).await? {
                    engine.set_role_password(role, secret).await
                } else {
                    engine.create_role(role, secret).await
                }
            })
            .await?;

        self.retry
            .run("create_database", StorageError::is_transient, move || async move {
                if !engine.database_exists(database).await? {
                    engine.create_database(database, role).await?;
                }
                Ok(())
            })
            .await?;

        self.retry
            .run("restrict_access", StorageError::is_transient, move || async move {
                engine.restrict_access(database, role).await
            })
            .await?;

        let conn = ConnectionDescriptor {
            db_name: names.database.clone(),
            db_host: db_host.clone(),
            db_port,
            db_user: names.role.clone(),
            db_password: password.clone(),
        };
        let conn_ref = &conn;
        self.retry
            .run("verify_connectivity", StorageError::is_transient, move || async move {
                engine.verify_connectivity(conn_ref).await
            })
            .await?;

        Ok(StorageDescriptor {
            db_name: names.database,
            db_host,
            db_port,
            db_user: names.role,
            db_password: self.cipher.seal(&password)?,
        })
    }

    async fn record_provisioned(&self, id: &TenantId, storage: StorageDescriptor) -> Result<StorageDescriptor, TenantError> {
        match self.registry.update_state(id, Transition::Provisioned(storage)).await {
            Ok(tenant) => {
                info!(tenant_id = %id, "Tenant provisioned");
                tenant
                    .storage
                    .ok_or_else(|| TenantError::Store(format!("storage missing after provisioning {}", id)))
            }
            Err(TenantError::InvalidTransition { .. }) => {
                // someone else recorded storage first
                let tenant = self.registry.get(id).await?;
                tenant.storage.ok_or(TenantError::InvalidTransition {
                    tenant_id: *id,
                    state: tenant.state,
                    transition: "provisioned",
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Compare the registry with the storage engine for one tenant and repair
    /// what can be repaired.
    pub async fn reconcile(&self, id: &TenantId) -> Result<ReconcileOutcome, TenantError> {
        let tenant = self.registry.get(id).await?;
        let names = PhysicalNames::for_tenant(id);

        if let Some(ref storage) = tenant.storage {
            let role = self.engine.role_exists(&storage.db_user).await?;
            let database = self.engine.database_exists(&storage.db_name).await?;
            if role && database {
                return Ok(ReconcileOutcome::Healthy);
            }
            error!(tenant_id = %id, role, database, "Provisioned tenant is missing storage resources");
            return Ok(ReconcileOutcome::Missing {
                role: !role,
                database: !database,
            });
        }

        match tenant.state {
            LifecycleState::Pending if tenant.is_active => {
                self.provision_storage(id).await?;
                Ok(ReconcileOutcome::Provisioned)
            }
            LifecycleState::Failed => {
                let Some(lease) = self
                    .registry
                    .try_lease(id, LeaseKind::Provisioning, &self.holder, self.lease_ttl)
                    .await?
                else {
                    return Ok(ReconcileOutcome::Skipped);
                };
                let result = self.roll_back(&names).await;
                self.registry.release_lease(&lease).await;
                let (role, database) = result?;
                if role || database {
                    info!(tenant_id = %id, role, database, "Rolled back partial provisioning");
                    Ok(ReconcileOutcome::RolledBack { role, database })
                } else {
                    Ok(ReconcileOutcome::Skipped)
                }
            }
            _ => Ok(ReconcileOutcome::Skipped),
        }
    }

    async fn roll_back(&self, names: &PhysicalNames) -> Result<(bool, bool), TenantError> {
        let database = self.engine.database_exists(&names.database).await?;
        if database {
            self.engine.drop_database(&names.database).await?;
        }
        let role = self.engine.role_exists(&names.role).await?;
        if role {
            self.engine.drop_role(&names.role).await?;
        }
        Ok((role, database))
    }
}

fn generate_password() -> SecretString {
    let password: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect();
    SecretString::from(password)
}
