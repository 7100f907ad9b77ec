//! Partitioned, bounded, TTL-expiring in-memory cache stores.
//!
//! Every cache is split per tenant partition: one short-lived default store
//! for lookups made before a partition can be resolved, plus one store per
//! partition key. Stores are independently size-bounded and expire entries
//! a fixed time after write.

pub mod partition;
pub mod partitioned_cache;
pub mod registry;

pub use partition::{FixedPartition, GlobalPartition, PartitionResolver, SwitchablePartition};
pub use partitioned_cache::PartitionedCache;
pub use registry::{CacheKind, CacheRegistry};
