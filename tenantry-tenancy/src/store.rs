//! Authoritative tenant store.
//!
//! Every tenant write goes through a [`TenantStore`]. Implementations must
//! make each call atomic: the record, the subdomain uniqueness index and the
//! appended events commit together or not at all.

use crate::error::StoreError;
use crate::tenant::{LifecycleState, Subdomain, Tenant, TenantId};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tenantry_events::{EventError, NewEvent, Outbox, OutboxLog, OutboxRecord};

/// What a lease protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseKind {
    Provisioning,
    Migration,
}

impl LeaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseKind::Provisioning => "provisioning",
            LeaseKind::Migration => "migration",
        }
    }
}

/// Time-bounded exclusive claim on one tenant operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub tenant_id: TenantId,
    pub kind: LeaseKind,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

/// Selection for [`TenantStore::list`].
#[derive(Debug, Clone, Default)]
pub struct TenantFilter {
    /// Empty means any state
    pub states: Vec<LifecycleState>,
    pub active: Option<bool>,
    pub limit: Option<usize>,
}

impl TenantFilter {
    pub fn in_states(states: &[LifecycleState]) -> Self {
        Self {
            states: states.to_vec(),
            ..Default::default()
        }
    }

    pub fn active_only(mut self) -> Self {
        self.active = Some(true);
        self
    }

    pub fn matches(&self, tenant: &Tenant) -> bool {
        (self.states.is_empty() || self.states.contains(&tenant.state))
            && self.active.is_none_or(|active| tenant.is_active == active)
    }
}

pub(crate) fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + TimeDelta::from_std(ttl).unwrap_or_else(|_| TimeDelta::seconds(300))
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Insert a new tenant. Fails with `AlreadyExists` when another tenant
    /// holds the subdomain, released tenants excepted.
    async fn insert(&self, tenant: &Tenant, events: Vec<NewEvent>) -> Result<Tenant, StoreError>;

    /// Replace a tenant if its stored revision still equals `expected_revision`.
    async fn update(
        &self,
        tenant: &Tenant,
        expected_revision: u64,
        events: Vec<NewEvent>,
    ) -> Result<Tenant, StoreError>;

    async fn find(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError>;

    /// The tenant currently holding `subdomain`.
    async fn find_by_subdomain(&self, subdomain: &Subdomain) -> Result<Option<Tenant>, StoreError>;

    async fn list(&self, filter: &TenantFilter) -> Result<Vec<Tenant>, StoreError>;

    /// Take the lease if it is free, expired, or already ours.
    async fn try_acquire_lease(
        &self,
        id: &TenantId,
        kind: LeaseKind,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError>;

    async fn release_lease(&self, id: &TenantId, kind: LeaseKind, holder: &str) -> Result<(), StoreError>;

    /// Audit log of one tenant's events.
    async fn events(&self, id: &TenantId) -> Result<Vec<OutboxRecord>, StoreError>;
}

#[derive(Default)]
struct State {
    tenants: HashMap<TenantId, Tenant>,
    by_subdomain: HashMap<String, TenantId>,
    outbox: OutboxLog,
    leases: HashMap<(TenantId, LeaseKind), Lease>,
}

/// Single-process store. One mutex makes every call a transaction.
#[derive(Default)]
pub struct InMemoryTenantStore {
    state: Mutex<State>,
}

impl InMemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TenantStore for InMemoryTenantStore {
    async fn insert(&self, tenant: &Tenant, events: Vec<NewEvent>) -> Result<Tenant, StoreError> {
        let mut state = self.state.lock();
        let key = tenant.subdomain.as_str().to_string();

        if state.by_subdomain.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        if state.tenants.contains_key(&tenant.id) {
            return Err(StoreError::AlreadyExists(tenant.id.to_string()));
        }

        let mut stored = tenant.clone();
        stored.revision = 1;
        let id = stored.id.to_string();
        for event in events {
            state.outbox.append(&id, event, stored.updated_at);
        }
        state.by_subdomain.insert(key, stored.id);
        state.tenants.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        tenant: &Tenant,
        expected_revision: u64,
        events: Vec<NewEvent>,
    ) -> Result<Tenant, StoreError> {
        let mut state = self.state.lock();
        let current = state
            .tenants
            .get(&tenant.id)
            .ok_or_else(|| StoreError::NotFound(tenant.id.to_string()))?;
        if current.revision != expected_revision {
            return Err(StoreError::Conflict(format!(
                "tenant {} at revision {}, expected {}",
                tenant.id, current.revision, expected_revision
            )));
        }

        let mut stored = tenant.clone();
        stored.revision = expected_revision + 1;

        let key = stored.subdomain.as_str().to_string();
        if stored.subdomain_released && state.by_subdomain.get(&key) == Some(&stored.id) {
            state.by_subdomain.remove(&key);
        }

        let id = stored.id.to_string();
        for event in events {
            state.outbox.append(&id, event, stored.updated_at);
        }
        state.tenants.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn find(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError> {
        Ok(self.state.lock().tenants.get(id).cloned())
    }

    async fn find_by_subdomain(&self, subdomain: &Subdomain) -> Result<Option<Tenant>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .by_subdomain
            .get(subdomain.as_str())
            .and_then(|id| state.tenants.get(id))
            .cloned())
    }

    async fn list(&self, filter: &TenantFilter) -> Result<Vec<Tenant>, StoreError> {
        let state = self.state.lock();
        let mut tenants: Vec<Tenant> = state
            .tenants
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tenants.sort_by_key(|t| t.created_at);
        if let Some(limit) = filter.limit {
            tenants.truncate(limit);
        }
        Ok(tenants)
    }

    async fn try_acquire_lease(
        &self,
        id: &TenantId,
        kind: LeaseKind,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock();

        if let Some(existing) = state.leases.get(&(*id, kind)) {
            if existing.holder != holder && existing.expires_at > now {
                return Ok(None);
            }
        }

        let lease = Lease {
            tenant_id: *id,
            kind,
            holder: holder.to_string(),
            expires_at: lease_expiry(now, ttl),
        };
        state.leases.insert((*id, kind), lease.clone());
        Ok(Some(lease))
    }

    async fn release_lease(&self, id: &TenantId, kind: LeaseKind, holder: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state
            .leases
            .get(&(*id, kind))
            .is_some_and(|lease| lease.holder == holder)
        {
            state.leases.remove(&(*id, kind));
        }
        Ok(())
    }

    async fn events(&self, id: &TenantId) -> Result<Vec<OutboxRecord>, StoreError> {
        Ok(self.state.lock().outbox.records_for(&id.to_string()))
    }
}

#[async_trait]
impl Outbox for InMemoryTenantStore {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, EventError> {
        Ok(self.state.lock().outbox.pending(limit, Utc::now()))
    }

    async fn mark_delivered(&self, tenant_id: &str, sequence: u64) -> Result<(), EventError> {
        if self.state.lock().outbox.mark_delivered(tenant_id, sequence, Utc::now()) {
            Ok(())
        } else {
            Err(EventError::Outbox(format!("unknown record {}:{}", tenant_id, sequence)))
        }
    }

    async fn record_failure(
        &self,
        tenant_id: &str,
        sequence: u64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), EventError> {
        if self
            .state
            .lock()
            .outbox
            .record_failure(tenant_id, sequence, error, retry_at)
        {
            Ok(())
        } else {
            Err(EventError::Outbox(format!("unknown record {}:{}", tenant_id, sequence)))
        }
    }
}
