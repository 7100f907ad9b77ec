use std::sync::Arc;

use dashmap::DashMap;
use shared::config::CacheSettings;
use tracing::info;

use crate::partition::PartitionResolver;
use crate::partitioned_cache::PartitionedCache;

/// What a cache holds, from the point of view of invalidation routing.
/// Entity changes can invalidate arbitrarily many cached query results, so
/// inbound entity invalidations sweep the `QueryResults` caches too.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheKind {
    Entity,
    Collection,
    QueryResults,
    Timestamps,
}

/// Map from cache name to engine instance, used to route inbound
/// invalidation messages to the right cache.
///
/// Built explicitly at startup and passed to whatever needs it; call
/// [`CacheRegistry::clear`] at shutdown.
pub struct CacheRegistry<V>
where
    V: Clone + Send + Sync + 'static,
{
    settings: CacheSettings,
    resolver: Arc<dyn PartitionResolver>,
    caches: DashMap<String, Arc<PartitionedCache<V>>>,
}

impl<V> CacheRegistry<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(settings: CacheSettings, resolver: Arc<dyn PartitionResolver>) -> Self {
        Self {
            settings,
            resolver,
            caches: DashMap::new(),
        }
    }

    pub fn resolver(&self) -> Arc<dyn PartitionResolver> {
        self.resolver.clone()
    }

    /// Build and register a cache with the registry's settings. Returns the
    /// existing instance when the name is already taken.
    pub fn create_cache(&self, name: &str, kind: CacheKind) -> Arc<PartitionedCache<V>> {
        self.create_cache_with(name, kind, self.settings.clone())
    }

    /// Same as [`create_cache`](Self::create_cache) but with per-cache
    /// settings, e.g. a max-size override from config.
    pub fn create_cache_with(
        &self,
        name: &str,
        kind: CacheKind,
        settings: CacheSettings,
    ) -> Arc<PartitionedCache<V>> {
        if let Some(existing) = self.caches.get(name) {
            info!("create_cache: returning existing cache {}", name);
            return existing.clone();
        }
        let cache = Arc::new(PartitionedCache::new(
            name,
            kind,
            settings,
            self.resolver.clone(),
        ));
        self.caches.insert(name.to_string(), cache.clone());
        cache
    }

    pub fn register(&self, cache: Arc<PartitionedCache<V>>) {
        self.caches.insert(cache.name().to_string(), cache);
    }

    pub fn get(&self, name: &str) -> Option<Arc<PartitionedCache<V>>> {
        self.caches.get(name).map(|entry| entry.clone())
    }

    /// All query-result caches, the sweep targets of entity invalidations.
    pub fn query_caches(&self) -> Vec<Arc<PartitionedCache<V>>> {
        self.caches
            .iter()
            .filter(|entry| entry.kind() == CacheKind::QueryResults)
            .map(|entry| entry.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<PartitionedCache<V>>> {
        self.caches.iter().map(|entry| entry.clone()).collect()
    }

    pub fn clear(&self) {
        self.caches.clear();
    }
}
