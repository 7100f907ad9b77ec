use std::sync::Arc;

use dashmap::DashMap;
use moka::future::Cache;
use shared::config::CacheSettings;

use crate::partition::PartitionResolver;
use crate::registry::CacheKind;

/// One named cache, split into per-partition moka stores.
///
/// Reads and writes resolve the acting partition through the injected
/// [`PartitionResolver`] and touch only that partition's store. Lookups with
/// no resolved partition go to the `default_store`, which runs with a short
/// TTL: entries can land there before partition resolution is available, so
/// every invalidation clears it as well.
pub struct PartitionedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    name: String,
    kind: CacheKind,
    settings: CacheSettings,
    resolver: Arc<dyn PartitionResolver>,
    default_store: Cache<String, V>,
    partitions: DashMap<String, Cache<String, V>>,
}

impl<V> PartitionedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        kind: CacheKind,
        settings: CacheSettings,
        resolver: Arc<dyn PartitionResolver>,
    ) -> Self {
        let name = name.into();
        let default_store = Cache::builder()
            .name(&name)
            .max_capacity(settings.max_size)
            .time_to_live(settings.default_ttl)
            .build();
        Self {
            name,
            kind,
            settings,
            resolver,
            default_store,
            partitions: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    /// Store for one partition, created on first use with the full cache TTL.
    fn partition_store(&self, partition: &str) -> Cache<String, V> {
        self.partitions
            .entry(partition.to_string())
            .or_insert_with(|| {
                Cache::builder()
                    .name(&format!("{}/{}", self.name, partition))
                    .max_capacity(self.settings.max_size)
                    .time_to_live(self.settings.ttl)
                    .build()
            })
            .clone()
    }

    /// Store the current work-unit's operations route to.
    fn resolved_store(&self) -> Cache<String, V> {
        match self.resolver.current_partition() {
            Some(partition) => self.partition_store(&partition),
            None => self.default_store.clone(),
        }
    }

    /// Read from the resolved partition's store only.
    pub async fn get(&self, key: &str) -> Option<V> {
        self.resolved_store().get(key).await
    }

    /// Write to the resolved partition's store only.
    pub async fn put(&self, key: impl Into<String>, value: V) {
        self.resolved_store().insert(key.into(), value).await;
    }

    /// Evict one key from the given partition's store and, unconditionally,
    /// from the default store. The same item may have been written to the
    /// default store by a lookup made before the partition was resolved.
    pub async fn invalidate(&self, key: &str, partition: Option<&str>) {
        if let Some(partition) = partition {
            // Clone the store out of the map guard; awaiting while the guard
            // is held keeps the shard locked against concurrent writers.
            let store = self.partitions.get(partition).map(|store| store.clone());
            if let Some(store) = store {
                store.invalidate(key).await;
            }
        }
        self.default_store.invalidate(key).await;
    }

    /// Clear one partition's store and the default store. A no-op when the
    /// target store does not exist or holds nothing; message delivery to
    /// peers is a separate concern and never gated on this check.
    pub async fn invalidate_all(&self, partition: Option<&str>) {
        let store = match partition {
            Some(partition) => match self.partitions.get(partition) {
                Some(store) => store.clone(),
                None => return,
            },
            None => self.default_store.clone(),
        };
        store.run_pending_tasks().await;
        if store.entry_count() == 0 {
            return;
        }
        store.invalidate_all();
        self.default_store.invalidate_all();
    }

    /// Clear every store of this cache.
    pub async fn invalidate_everything(&self) {
        for entry in self.partitions.iter() {
            entry.value().invalidate_all();
        }
        self.default_store.invalidate_all();
    }

    /// Entry count of one partition's store (the default store for `None`).
    pub async fn entry_count(&self, partition: Option<&str>) -> u64 {
        let store = match partition {
            Some(partition) => match self.partitions.get(partition) {
                Some(store) => store.clone(),
                None => return 0,
            },
            None => self.default_store.clone(),
        };
        store.run_pending_tasks().await;
        store.entry_count()
    }
}
