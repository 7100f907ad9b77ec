use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cluster_tcp::{ChannelListener, ClusterMessage, NotificationChannel};
use storage_engine::{CacheKind, CacheRegistry};

/// Opaque handle scoping pending invalidations to one unit of work.
///
/// The caller creates one per transaction and passes it to every enqueue,
/// then settles it with exactly one commit or rollback.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkUnit(Uuid);

impl WorkUnit {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One deferred eviction. A `None` key is the transaction-lock sentinel: it
/// carries no direct eviction, only the partition whose query-result caches
/// must be swept after commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingInvalidation {
    pub cache_name: String,
    pub key: Option<String>,
    pub partition: Option<String>,
}

#[derive(Default)]
struct InvalidationBatch {
    items: Vec<PendingInvalidation>,
    locked: bool,
}

/// Handles a broadcast published under one topic. Errors are logged and
/// contained per listener.
pub trait BroadcastListener: Send + Sync + 'static {
    fn receive(&self, key: &str, value: &Bytes) -> shared::Result<()>;
}

/// Batches invalidations per [`WorkUnit`] and settles them transactionally.
///
/// Commit applies the batch locally and sends one message per keyed item to
/// the cluster; rollback drops the batch without a trace. Inbound messages
/// from peers evict locally and are never re-broadcast, so a single write
/// produces exactly one message per peer cluster-wide.
///
/// Nothing here fails the caller's transaction: cache trouble is logged and
/// swallowed, and the channel send is fire-and-forget.
pub struct InvalidationCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    registry: Arc<CacheRegistry<V>>,
    channel: Option<Arc<dyn NotificationChannel>>,
    batches: DashMap<WorkUnit, InvalidationBatch>,
    broadcast_listeners: RwLock<Vec<(String, Arc<dyn BroadcastListener>)>>,
}

impl<V> InvalidationCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// A coordinator without a channel works standalone: local semantics are
    /// identical, nothing leaves the node.
    pub fn new(
        registry: Arc<CacheRegistry<V>>,
        channel: Option<Arc<dyn NotificationChannel>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            channel,
            batches: DashMap::new(),
            broadcast_listeners: RwLock::new(Vec::new()),
        })
    }

    /// Record an invalidation to apply at commit time. The query-result
    /// caches of the affected partition are cleared immediately so the same
    /// transaction cannot keep reading query results it just made stale.
    pub async fn enqueue(
        &self,
        work_unit: &WorkUnit,
        cache_name: &str,
        key: &str,
        partition: Option<&str>,
    ) {
        self.batches
            .entry(work_unit.clone())
            .or_default()
            .items
            .push(PendingInvalidation {
                cache_name: cache_name.to_string(),
                key: Some(key.to_string()),
                partition: partition.map(str::to_string),
            });
        self.invalidate_query_caches(partition).await;
    }

    /// Mark the work-unit so cache writes made under it can be suppressed,
    /// and schedule a post-commit query-cache sweep of the partition the
    /// work-unit is currently acting in.
    pub fn lock_for_transaction(&self, work_unit: &WorkUnit) {
        let partition = self.registry.resolver().current_partition();
        let mut batch = self.batches.entry(work_unit.clone()).or_default();
        batch.locked = true;
        // Sentinel: no cache, no key, only a partition to sweep on commit.
        batch.items.push(PendingInvalidation {
            cache_name: String::new(),
            key: None,
            partition,
        });
    }

    pub fn is_locked(&self, work_unit: &WorkUnit) -> bool {
        self.batches
            .get(work_unit)
            .map(|batch| batch.locked)
            .unwrap_or(false)
    }

    /// Apply the work-unit's batch: evict each keyed item locally, notify the
    /// cluster once per keyed item, then sweep query-result caches once per
    /// distinct partition the batch touched. An unknown or empty work-unit
    /// commits to nothing.
    pub async fn on_commit(&self, work_unit: &WorkUnit) {
        let Some((_, batch)) = self.batches.remove(work_unit) else {
            return;
        };
        if batch.items.is_empty() {
            return;
        }
        debug!(
            "committing {} pending invalidations for work-unit {}",
            batch.items.len(),
            work_unit
        );

        let mut partitions: Vec<Option<String>> = Vec::new();
        for item in &batch.items {
            if !partitions.contains(&item.partition) {
                partitions.push(item.partition.clone());
            }
            let Some(key) = &item.key else {
                continue;
            };
            match self.registry.get(&item.cache_name) {
                Some(cache) => cache.invalidate(key, item.partition.as_deref()).await,
                None => warn!("commit names unknown cache {}", item.cache_name),
            }
            if let Some(channel) = &self.channel {
                channel.send_notification(ClusterMessage::InvalidateItem {
                    cache_name: item.cache_name.clone(),
                    key: key.clone(),
                    partition: item.partition.clone(),
                });
            }
        }
        for partition in partitions {
            self.invalidate_query_caches(partition.as_deref()).await;
        }
    }

    /// Drop the work-unit's batch. Query-cache clears already performed at
    /// enqueue time are deliberately not undone; they only cost re-fetches.
    pub fn on_rollback(&self, work_unit: &WorkUnit) {
        if self.batches.remove(work_unit).is_some() {
            debug!("rolled back work-unit {}", work_unit);
        }
    }

    /// Apply a message received from a peer. Local effects only; nothing is
    /// ever sent back out from here.
    pub async fn on_invalidate_message(&self, msg: ClusterMessage) {
        match msg {
            ClusterMessage::InvalidateItem {
                cache_name,
                key,
                partition,
            } => match self.registry.get(&cache_name) {
                Some(cache) => {
                    cache.invalidate(&key, partition.as_deref()).await;
                    if cache.kind() == CacheKind::Entity {
                        self.invalidate_query_caches(partition.as_deref()).await;
                    }
                }
                None => {
                    // The cache may simply not have been created on this
                    // node yet, but the entity change behind the message is
                    // real; stale query results must still go.
                    debug!("invalidation for unknown cache {}", cache_name);
                    self.invalidate_query_caches(partition.as_deref()).await;
                }
            },
            ClusterMessage::InvalidateAll { cache_name } => {
                info!("clearing cache {} on peer request", cache_name);
                if let Some(cache) = self.registry.get(&cache_name) {
                    cache.invalidate_everything().await;
                }
            }
            ClusterMessage::Broadcast { topic, key, value } => {
                self.dispatch_broadcast(&topic, &key, &value).await;
            }
        }
    }

    /// Publish an application-level message to every peer. Local listeners
    /// on the topic are not invoked; the mesh carries it to remote nodes
    /// only.
    pub fn broadcast(&self, topic: &str, key: &str, value: Bytes) {
        if let Some(channel) = &self.channel {
            channel.send_notification(ClusterMessage::Broadcast {
                topic: topic.to_string(),
                key: key.to_string(),
                value,
            });
        }
    }

    pub async fn register_broadcast_listener(
        &self,
        topic: &str,
        listener: Arc<dyn BroadcastListener>,
    ) {
        self.broadcast_listeners
            .write()
            .await
            .push((topic.to_string(), listener));
    }

    async fn dispatch_broadcast(&self, topic: &str, key: &str, value: &Bytes) {
        let listeners = self.broadcast_listeners.read().await;
        for (registered_topic, listener) in listeners.iter() {
            if registered_topic != topic {
                continue;
            }
            if let Err(e) = listener.receive(key, value) {
                warn!("broadcast listener for topic {} failed: {}", topic, e);
            }
        }
    }

    async fn invalidate_query_caches(&self, partition: Option<&str>) {
        for cache in self.registry.query_caches() {
            cache.invalidate_all(partition).await;
        }
    }
}

#[async_trait]
impl<V> ChannelListener for InvalidationCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn on_message(&self, _source: Uuid, msg: ClusterMessage) -> shared::Result<()> {
        self.on_invalidate_message(msg).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::config::CacheSettings;
    use std::sync::Mutex;
    use storage_engine::SwitchablePartition;

    struct RecordingChannel {
        sent: Mutex<Vec<ClusterMessage>>,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<ClusterMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl NotificationChannel for RecordingChannel {
        fn send_notification(&self, msg: ClusterMessage) {
            self.sent.lock().unwrap().push(msg);
        }
    }

    struct Fixture {
        resolver: Arc<SwitchablePartition>,
        registry: Arc<CacheRegistry<String>>,
        channel: Arc<RecordingChannel>,
        coordinator: Arc<InvalidationCoordinator<String>>,
    }

    fn fixture() -> Fixture {
        let resolver = Arc::new(SwitchablePartition::new());
        let registry = Arc::new(CacheRegistry::new(
            CacheSettings::default(),
            resolver.clone(),
        ));
        registry.create_cache("entities", CacheKind::Entity);
        registry.create_cache("query-results", CacheKind::QueryResults);
        let channel = RecordingChannel::new();
        let coordinator = InvalidationCoordinator::new(registry.clone(), Some(channel.clone()));
        Fixture {
            resolver,
            registry,
            channel,
            coordinator,
        }
    }

    #[tokio::test]
    async fn rollback_leaves_the_engine_untouched() {
        let f = fixture();
        f.resolver.set(Some("p1".to_string()));
        let entities = f.registry.get("entities").unwrap();
        entities.put("k", "v".to_string()).await;

        let wu = WorkUnit::new();
        f.coordinator.enqueue(&wu, "entities", "k", Some("p1")).await;
        f.coordinator.on_rollback(&wu);

        assert_eq!(entities.get("k").await, Some("v".to_string()));
        assert!(f.channel.sent().is_empty());

        // The batch is gone: a later commit of the same handle is a no-op.
        f.coordinator.on_commit(&wu).await;
        assert_eq!(entities.get("k").await, Some("v".to_string()));
        assert!(f.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn enqueue_clears_query_caches_immediately() {
        let f = fixture();
        f.resolver.set(Some("p1".to_string()));
        let queries = f.registry.get("query-results").unwrap();
        queries.put("q", "stale".to_string()).await;

        let wu = WorkUnit::new();
        f.coordinator.enqueue(&wu, "entities", "k", Some("p1")).await;

        // Before any commit, this transaction must not re-read the result.
        assert_eq!(queries.get("q").await, None);
        // But nothing has gone to the cluster yet.
        assert!(f.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn commit_evicts_notifies_and_sweeps_per_partition() {
        let f = fixture();
        let entities = f.registry.get("entities").unwrap();
        let queries = f.registry.get("query-results").unwrap();

        f.resolver.set(Some("p1".to_string()));
        entities.put("k1", "1".to_string()).await;
        entities.put("k2", "2".to_string()).await;
        f.resolver.set(Some("p2".to_string()));
        entities.put("k3", "3".to_string()).await;

        let wu = WorkUnit::new();
        f.coordinator.enqueue(&wu, "entities", "k1", Some("p1")).await;
        f.coordinator.enqueue(&wu, "entities", "k2", Some("p1")).await;
        f.coordinator.enqueue(&wu, "entities", "k3", Some("p2")).await;

        // Repopulate after the enqueue-time clears so the commit-time sweep
        // is what we observe.
        f.resolver.set(Some("p1".to_string()));
        queries.put("qa", "a".to_string()).await;
        f.resolver.set(Some("p2".to_string()));
        queries.put("qb", "b".to_string()).await;

        f.coordinator.on_commit(&wu).await;

        // Three evictions.
        f.resolver.set(Some("p1".to_string()));
        assert_eq!(entities.get("k1").await, None);
        assert_eq!(entities.get("k2").await, None);
        f.resolver.set(Some("p2".to_string()));
        assert_eq!(entities.get("k3").await, None);

        // Query caches swept in both partitions.
        assert_eq!(queries.get("qb").await, None);
        f.resolver.set(Some("p1".to_string()));
        assert_eq!(queries.get("qa").await, None);

        // Exactly one message per keyed item, partition dedup notwithstanding.
        let sent = f.channel.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(
            sent[0],
            ClusterMessage::InvalidateItem {
                cache_name: "entities".to_string(),
                key: "k1".to_string(),
                partition: Some("p1".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn empty_commit_sends_nothing() {
        let f = fixture();
        f.coordinator.on_commit(&WorkUnit::new()).await;
        assert!(f.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn lock_marks_the_work_unit_and_sweeps_on_commit() {
        let f = fixture();
        f.resolver.set(Some("p1".to_string()));
        let queries = f.registry.get("query-results").unwrap();
        queries.put("q", "stale".to_string()).await;

        let wu = WorkUnit::new();
        assert!(!f.coordinator.is_locked(&wu));
        f.coordinator.lock_for_transaction(&wu);
        assert!(f.coordinator.is_locked(&wu));

        f.coordinator.on_commit(&wu).await;

        // The sentinel sweeps the locked partition but sends no message.
        assert_eq!(queries.get("q").await, None);
        assert!(f.channel.sent().is_empty());
        assert!(!f.coordinator.is_locked(&wu));
    }

    #[tokio::test]
    async fn inbound_entity_invalidation_sweeps_query_caches() {
        let f = fixture();
        f.resolver.set(Some("p1".to_string()));
        let entities = f.registry.get("entities").unwrap();
        let queries = f.registry.get("query-results").unwrap();
        entities.put("k", "v".to_string()).await;
        queries.put("q", "stale".to_string()).await;

        f.coordinator
            .on_invalidate_message(ClusterMessage::InvalidateItem {
                cache_name: "entities".to_string(),
                key: "k".to_string(),
                partition: Some("p1".to_string()),
            })
            .await;

        assert_eq!(entities.get("k").await, None);
        assert_eq!(queries.get("q").await, None);
        // Inbound messages are never re-broadcast.
        assert!(f.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn inbound_unknown_cache_still_sweeps_query_caches() {
        let f = fixture();
        f.resolver.set(Some("p1".to_string()));
        let queries = f.registry.get("query-results").unwrap();
        queries.put("q", "stale".to_string()).await;

        f.coordinator
            .on_invalidate_message(ClusterMessage::InvalidateItem {
                cache_name: "nobody-made-this".to_string(),
                key: "k".to_string(),
                partition: Some("p1".to_string()),
            })
            .await;

        assert_eq!(queries.get("q").await, None);
        assert!(f.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn inbound_invalidate_all_clears_every_partition() {
        let f = fixture();
        let entities = f.registry.get("entities").unwrap();
        f.resolver.set(Some("p1".to_string()));
        entities.put("a", "1".to_string()).await;
        f.resolver.set(Some("p2".to_string()));
        entities.put("b", "2".to_string()).await;

        f.coordinator
            .on_invalidate_message(ClusterMessage::InvalidateAll {
                cache_name: "entities".to_string(),
            })
            .await;

        assert_eq!(entities.get("b").await, None);
        f.resolver.set(Some("p1".to_string()));
        assert_eq!(entities.get("a").await, None);
    }

    #[tokio::test]
    async fn broadcast_reaches_matching_topic_listeners_only() {
        struct Topic {
            got: Mutex<Vec<(String, Bytes)>>,
        }
        impl BroadcastListener for Topic {
            fn receive(&self, key: &str, value: &Bytes) -> shared::Result<()> {
                self.got.lock().unwrap().push((key.to_string(), value.clone()));
                Ok(())
            }
        }

        let f = fixture();
        let settings = Arc::new(Topic {
            got: Mutex::new(Vec::new()),
        });
        let other = Arc::new(Topic {
            got: Mutex::new(Vec::new()),
        });
        f.coordinator
            .register_broadcast_listener("settings", settings.clone())
            .await;
        f.coordinator
            .register_broadcast_listener("other", other.clone())
            .await;

        f.coordinator
            .on_invalidate_message(ClusterMessage::Broadcast {
                topic: "settings".to_string(),
                key: "theme".to_string(),
                value: Bytes::from_static(b"dark"),
            })
            .await;

        assert_eq!(
            settings.got.lock().unwrap().clone(),
            vec![("theme".to_string(), Bytes::from_static(b"dark"))]
        );
        assert!(other.got.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn outbound_broadcast_goes_through_the_channel() {
        let f = fixture();
        f.coordinator
            .broadcast("settings", "theme", Bytes::from_static(b"dark"));
        assert_eq!(
            f.channel.sent(),
            vec![ClusterMessage::Broadcast {
                topic: "settings".to_string(),
                key: "theme".to_string(),
                value: Bytes::from_static(b"dark"),
            }]
        );
    }
}
