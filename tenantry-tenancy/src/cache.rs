//! Read-through cache in front of subdomain lookups.

use crate::tenant::Tenant;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct Entry {
    tenant: Tenant,
    cached_at: Instant,
}

/// Short-lived copies of tenant records keyed by subdomain.
///
/// Never authoritative. The registry calls [`invalidate`](Self::invalidate)
/// after every committed transition; the TTL bounds staleness caused by
/// writes from other control plane instances.
///
/// Each key carries a generation counter so that a lookup which raced with
/// an invalidation cannot re-insert the record it read before the write.
pub struct ResolverCache {
    ttl: Duration,
    entries: DashMap<String, Entry>,
    generations: DashMap<String, u64>,
}

impl ResolverCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            generations: DashMap::new(),
        }
    }

    /// Cache that never holds anything.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, subdomain: &str) -> Option<Tenant> {
        let entry = self.entries.get(subdomain)?;
        if entry.cached_at.elapsed() < self.ttl {
            return Some(entry.tenant.clone());
        }
        drop(entry);
        self.entries.remove(subdomain);
        None
    }

    /// Generation to pass to [`insert`](Self::insert) after reading the store.
    pub fn generation(&self, subdomain: &str) -> u64 {
        self.generations.get(subdomain).map(|g| *g).unwrap_or(0)
    }

    /// Insert unless the key was invalidated since `generation` was read.
    pub fn insert(&self, tenant: Tenant, generation: u64) {
        if self.ttl.is_zero() {
            return;
        }
        let key = tenant.subdomain.as_str().to_string();
        let current = self.generations.entry(key.clone()).or_insert(0);
        if *current != generation {
            return;
        }
        // generation guard held while inserting
        self.entries.insert(
            key,
            Entry {
                tenant,
                cached_at: Instant::now(),
            },
        );
        drop(current);
    }

    pub fn invalidate(&self, subdomain: &str) {
        let mut generation = self.generations.entry(subdomain.to_string()).or_insert(0);
        *generation += 1;
        self.entries.remove(subdomain);
        drop(generation);
    }

    pub fn clear(&self) {
        for mut generation in self.generations.iter_mut() {
            *generation += 1;
        }
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::{Subdomain, TenantId};
    use chrono::Utc;

    fn tenant(subdomain: &str) -> Tenant {
        Tenant::pending(
            TenantId::new(),
            "T".into(),
            Subdomain::parse(subdomain).unwrap(),
            Utc::now(),
        )
    }

    #[test]
    fn test_insert_and_get() {
        let cache = ResolverCache::new(Duration::from_secs(30));
        let t = tenant("acme");
        cache.insert(t.clone(), cache.generation("acme"));
        assert_eq!(cache.get("acme").unwrap().id, t.id);
        assert!(cache.get("beta").is_none());
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let cache = ResolverCache::new(Duration::from_secs(30));
        cache.insert(tenant("acme"), 0);
        cache.invalidate("acme");
        assert!(cache.get("acme").is_none());
    }

    #[test]
    fn test_stale_read_not_reinserted() {
        let cache = ResolverCache::new(Duration::from_secs(30));
        let seen = cache.generation("acme");
        // a write lands between the store read and the cache fill
        cache.invalidate("acme");
        cache.insert(tenant("acme"), seen);
        assert!(cache.get("acme").is_none());
    }

    #[test]
    fn test_entries_expire() {
        let cache = ResolverCache::new(Duration::from_millis(1));
        cache.insert(tenant("acme"), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("acme").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_disabled_cache_holds_nothing() {
        let cache = ResolverCache::disabled();
        cache.insert(tenant("acme"), 0);
        assert!(cache.is_empty());
    }
}
