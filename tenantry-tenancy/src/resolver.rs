//! Subdomain Resolver
//!
//! Read path consulted on every data-plane request. Pure read: it never
//! provisions or writes, and it goes to the store's subdomain index only on
//! a cache miss.

use crate::cache::ResolverCache;
use crate::crypto::SecretCipher;
use crate::error::TenantError;
use crate::store::TenantStore;
use crate::tenant::{ConnectionDescriptor, Subdomain, Tenant, TenantId};
use std::sync::Arc;
use tracing::{debug, trace};

/// Where to route a request for a subdomain.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTenant {
    pub tenant_id: TenantId,
    pub subdomain: Subdomain,
    pub migration_version: u32,
    pub descriptor: ConnectionDescriptor,
}

pub struct SubdomainResolver {
    store: Arc<dyn TenantStore>,
    cache: Arc<ResolverCache>,
    cipher: Arc<SecretCipher>,
    base_domain: Option<String>,
}

impl SubdomainResolver {
    pub fn new(store: Arc<dyn TenantStore>, cache: Arc<ResolverCache>, cipher: Arc<SecretCipher>) -> Self {
        Self {
            store,
            cache,
            cipher,
            base_domain: None,
        }
    }

    /// Domain under which tenant subdomains live, e.g. `example.com`.
    pub fn with_base_domain(mut self, base_domain: impl Into<String>) -> Self {
        self.base_domain = Some(base_domain.into().trim_matches('.').to_ascii_lowercase());
        self
    }

    /// Tenant record for a subdomain, whatever its state.
    pub async fn lookup(&self, subdomain: &str) -> Result<Tenant, TenantError> {
        // a malformed subdomain cannot belong to anyone
        let subdomain = Subdomain::parse(subdomain).map_err(|_| TenantError::NotFound(subdomain.to_string()))?;

        if let Some(tenant) = self.cache.get(subdomain.as_str()) {
            trace!(subdomain = %subdomain, "Resolver cache hit");
            return Ok(tenant);
        }

        let generation = self.cache.generation(subdomain.as_str());
        let tenant = self
            .store
            .find_by_subdomain(&subdomain)
            .await?
            .ok_or_else(|| TenantError::NotFound(subdomain.to_string()))?;
        self.cache.insert(tenant.clone(), generation);
        Ok(tenant)
    }

    /// Resolve a subdomain to the connection descriptor of its database.
    pub async fn resolve(&self, subdomain: &str) -> Result<ResolvedTenant, TenantError> {
        let tenant = self.lookup(subdomain).await?;

        if !tenant.is_active {
            debug!(tenant_id = %tenant.id, subdomain = %tenant.subdomain, "Resolution refused for inactive tenant");
            return Err(TenantError::Inactive(tenant.subdomain.to_string()));
        }
        let storage = match tenant.storage {
            Some(ref storage) if tenant.is_serving() => storage,
            _ => {
                return Err(TenantError::NotReady {
                    tenant_id: tenant.id,
                    state: tenant.state,
                });
            }
        };

        Ok(ResolvedTenant {
            tenant_id: tenant.id,
            descriptor: storage.unseal(&self.cipher)?,
            migration_version: tenant.migration_version,
            subdomain: tenant.subdomain,
        })
    }

    /// Resolve from an HTTP `Host` header value.
    pub async fn resolve_host(&self, host: &str) -> Result<ResolvedTenant, TenantError> {
        let subdomain = self
            .extract_subdomain(host)
            .ok_or_else(|| TenantError::NotFound(host.to_string()))?;
        self.resolve(&subdomain).await
    }

    fn extract_subdomain(&self, host: &str) -> Option<String> {
        let base = self.base_domain.as_deref()?;
        let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
        let subdomain = host.strip_suffix(base)?.strip_suffix('.')?;

        if subdomain.is_empty() || subdomain.contains('.') {
            return None;
        }
        Some(subdomain.to_string())
    }
}
