//! Tenant Registry
//!
//! The only writer of tenant state. Provisioner, coordinator and
//! administrative actions all change tenants through [`TenantRegistry`],
//! which validates the transition, writes it to the authoritative store
//! together with its events, and then drops the cached copy.

use crate::cache::ResolverCache;
use crate::error::{StoreError, TenantError};
use crate::store::{Lease, LeaseKind, TenantFilter, TenantStore};
use crate::tenant::{Subdomain, Tenant, TenantId, Transition, TransitionOutcome, validate_name};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tenantry_events::{NewEvent, OutboxRecord};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Attempts of the read-apply-write loop before giving up on a hot record.
const MAX_WRITE_ATTEMPTS: u32 = 8;

pub struct TenantRegistry {
    store: Arc<dyn TenantStore>,
    cache: Arc<ResolverCache>,
    outbox_signal: Option<Arc<Notify>>,
}

impl TenantRegistry {
    pub fn new(store: Arc<dyn TenantStore>, cache: Arc<ResolverCache>) -> Self {
        Self {
            store,
            cache,
            outbox_signal: None,
        }
    }

    /// Nudge the event relay whenever events were written.
    pub fn with_outbox_signal(mut self, signal: Arc<Notify>) -> Self {
        self.outbox_signal = Some(signal);
        self
    }

    pub fn cache(&self) -> &Arc<ResolverCache> {
        &self.cache
    }

    /// Reserve a subdomain and create the tenant in `pending` state.
    ///
    /// Uniqueness is enforced by the store, so concurrent reservations from
    /// any number of instances yield exactly one winner.
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::time::Duration;
    /// use tenantry_tenancy::{InMemoryTenantStore, LifecycleState, ResolverCache, TenantError, TenantRegistry};
    ///
    /// # tokio_test::block_on(async {
    /// let registry = TenantRegistry::new(
    ///     Arc::new(InMemoryTenantStore::new()),
    ///     Arc::new(ResolverCache::new(Duration::from_secs(30))),
    /// );
    ///
    /// let tenant = registry.reserve("Acme", "Acme Corp").await.unwrap();
    /// assert_eq!(tenant.subdomain.as_str(), "acme");
    /// assert_eq!(tenant.state, LifecycleState::Pending);
    ///
    /// let taken = registry.reserve("acme", "Impostor").await;
    /// assert!(matches!(taken, Err(TenantError::SubdomainTaken(_))));
    /// # });
    /// ```
    pub async fn reserve(&self, subdomain: &str, name: &str) -> Result<Tenant, TenantError> {
        let subdomain = Subdomain::parse(subdomain)?;
        let name = validate_name(name)?;

        let tenant = Tenant::pending(TenantId::new(), name, subdomain, Utc::now());
        let event = NewEvent::tenant_created(&tenant.name, tenant.subdomain.as_str());

        let stored = match self.store.insert(&tenant, vec![event]).await {
            Ok(stored) => stored,
            Err(StoreError::AlreadyExists(_)) => {
                debug!(subdomain = %tenant.subdomain, "Subdomain already reserved");
                return Err(TenantError::SubdomainTaken(tenant.subdomain.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        self.after_write(&stored, true);
        info!(tenant_id = %stored.id, subdomain = %stored.subdomain, "Tenant reserved");
        Ok(stored)
    }

    pub async fn get(&self, id: &TenantId) -> Result<Tenant, TenantError> {
        self.store
            .find(id)
            .await?
            .ok_or_else(|| TenantError::NotFound(id.to_string()))
    }

    /// Authoritative lookup, bypassing the cache.
    pub async fn get_by_subdomain(&self, subdomain: &str) -> Result<Tenant, TenantError> {
        let parsed = Subdomain::parse(subdomain).map_err(|_| TenantError::NotFound(subdomain.to_string()))?;
        self.store
            .find_by_subdomain(&parsed)
            .await?
            .ok_or_else(|| TenantError::NotFound(parsed.to_string()))
    }

    pub async fn list(&self, filter: &TenantFilter) -> Result<Vec<Tenant>, TenantError> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn events(&self, id: &TenantId) -> Result<Vec<OutboxRecord>, TenantError> {
        Ok(self.store.events(id).await?)
    }

    /// Apply a transition with optimistic concurrency.
    ///
    /// The record is re-read and the transition re-validated whenever another
    /// writer got there first.
    pub async fn update_state(&self, id: &TenantId, transition: Transition) -> Result<Tenant, TenantError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut tenant = self.get(id).await?;
            let expected = tenant.revision;

            let events = match tenant.apply(&transition, Utc::now())? {
                TransitionOutcome::Unchanged => return Ok(tenant),
                TransitionOutcome::Changed(events) => events,
            };
            let has_events = !events.is_empty();

            match self.store.update(&tenant, expected, events).await {
                Ok(stored) => {
                    self.after_write(&stored, has_events);
                    debug!(
                        tenant_id = %id,
                        transition = transition.name(),
                        state = %stored.state,
                        migration_version = stored.migration_version,
                        "Tenant updated"
                    );
                    return Ok(stored);
                }
                Err(StoreError::Conflict(reason)) => {
                    debug!(tenant_id = %id, attempt, reason = %reason, "Revision conflict, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(tenant_id = %id, transition = transition.name(), "Gave up after repeated conflicts");
        Err(TenantError::Conflict(*id))
    }

    /// Soft delete: data retained, resolution reports `Inactive`.
    pub async fn deactivate(&self, id: &TenantId) -> Result<Tenant, TenantError> {
        let tenant = self.update_state(id, Transition::Deactivate).await?;
        info!(tenant_id = %id, "Tenant deactivated");
        Ok(tenant)
    }

    pub async fn reactivate(&self, id: &TenantId) -> Result<Tenant, TenantError> {
        let tenant = self.update_state(id, Transition::Reactivate).await?;
        info!(tenant_id = %id, "Tenant reactivated");
        Ok(tenant)
    }

    /// Let a later `reserve` take the subdomain of an inactive tenant.
    pub async fn release_subdomain(&self, id: &TenantId) -> Result<Tenant, TenantError> {
        let tenant = self.update_state(id, Transition::ReleaseSubdomain).await?;
        info!(tenant_id = %id, subdomain = %tenant.subdomain, "Subdomain released");
        Ok(tenant)
    }

    pub async fn retry_provisioning(&self, id: &TenantId) -> Result<Tenant, TenantError> {
        self.update_state(id, Transition::RetryProvisioning).await
    }

    pub(crate) async fn try_lease(
        &self,
        id: &TenantId,
        kind: LeaseKind,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, TenantError> {
        Ok(self.store.try_acquire_lease(id, kind, holder, ttl).await?)
    }

    pub(crate) async fn release_lease(&self, lease: &Lease) {
        if let Err(err) = self
            .store
            .release_lease(&lease.tenant_id, lease.kind, &lease.holder)
            .await
        {
            // expiry reclaims it
            warn!(tenant_id = %lease.tenant_id, kind = lease.kind.as_str(), error = %err, "Failed to release lease");
        }
    }

    fn after_write(&self, tenant: &Tenant, has_events: bool) {
        self.cache.invalidate(tenant.subdomain.as_str());
        if has_events {
            if let Some(ref signal) = self.outbox_signal {
                signal.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTenantStore;
    use crate::tenant::{LifecycleState, TenantStatus};
    use tenantry_events::EventType;

    fn registry() -> TenantRegistry {
        TenantRegistry::new(
            Arc::new(InMemoryTenantStore::new()),
            Arc::new(ResolverCache::new(Duration::from_secs(30))),
        )
    }

    #[tokio::test]
    async fn test_reserve_creates_pending_tenant() {
        let registry = registry();
        let tenant = registry.reserve("Acme", "Acme Corp").await.unwrap();

        assert_eq!(tenant.subdomain.as_str(), "acme");
        assert_eq!(tenant.state, LifecycleState::Pending);
        assert!(tenant.is_active);
        assert_eq!(tenant.migration_version, 0);

        let events = registry.events(&tenant.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].envelope.event_type, EventType::TenantCreated);
    }

    #[tokio::test]
    async fn test_reserve_is_case_insensitive_unique() {
        let registry = registry();
        registry.reserve("acme", "Acme").await.unwrap();

        let err = registry.reserve("ACME", "Other").await.unwrap_err();
        assert_eq!(err.code(), "SUBDOMAIN_TAKEN");
    }

    #[tokio::test]
    async fn test_reserve_validates_input() {
        let registry = registry();
        assert_eq!(registry.reserve("no spaces", "X").await.unwrap_err().code(), "VALIDATION_ERROR");
        assert_eq!(registry.reserve("ok", " ").await.unwrap_err().code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_lookup_not_found() {
        let registry = registry();
        assert!(matches!(registry.get(&TenantId::new()).await, Err(TenantError::NotFound(_))));
        assert!(matches!(
            registry.get_by_subdomain("ghost").await,
            Err(TenantError::NotFound(_))
        ));
        assert!(matches!(
            registry.get_by_subdomain("not valid!").await,
            Err(TenantError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deactivate_keeps_subdomain_reserved() {
        let registry = registry();
        let tenant = registry.reserve("acme", "Acme").await.unwrap();
        registry.deactivate(&tenant.id).await.unwrap();

        let found = registry.get_by_subdomain("acme").await.unwrap();
        assert_eq!(found.status(), TenantStatus::Inactive);
        assert!(registry.reserve("acme", "Squatter").await.is_err());

        registry.release_subdomain(&tenant.id).await.unwrap();
        let fresh = registry.reserve("acme", "New Acme").await.unwrap();
        assert_ne!(fresh.id, tenant.id);
        assert!(registry.reactivate(&tenant.id).await.is_err());
    }

    #[tokio::test]
    async fn test_repeat_deactivate_emits_one_event() {
        let registry = registry();
        let tenant = registry.reserve("acme", "Acme").await.unwrap();
        registry.deactivate(&tenant.id).await.unwrap();
        registry.deactivate(&tenant.id).await.unwrap();

        let deactivations = registry
            .events(&tenant.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.envelope.event_type == EventType::TenantDeactivated)
            .count();
        assert_eq!(deactivations, 1);
    }

    #[tokio::test]
    async fn test_write_invalidates_cache() {
        let registry = registry();
        let tenant = registry.reserve("acme", "Acme").await.unwrap();
        let cache = registry.cache().clone();
        cache.insert(tenant.clone(), cache.generation("acme"));
        assert!(cache.get("acme").is_some());

        registry.deactivate(&tenant.id).await.unwrap();
        assert!(cache.get("acme").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_transitions_serialize() {
        let registry = Arc::new(registry());
        let tenant = registry.reserve("acme", "Acme").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let registry = registry.clone();
            let id = tenant.id;
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    registry.deactivate(&id).await
                } else {
                    registry.reactivate(&id).await
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // every change was a real flip, so events alternate
        let kinds: Vec<EventType> = registry
            .events(&tenant.id)
            .await
            .unwrap()
            .into_iter()
            .skip(1)
            .map(|r| r.envelope.event_type)
            .collect();
        for pair in kinds.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }
}
