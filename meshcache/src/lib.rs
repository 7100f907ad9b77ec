//! Cluster-coherent cache invalidation.
//!
//! Writes made inside a unit of work enqueue invalidations against an
//! explicit [`WorkUnit`] handle. On commit the pending batch is applied to
//! the local [`storage_engine`] caches and broadcast to every peer over the
//! [`cluster_tcp`] mesh; on rollback it evaporates. Inbound peer messages
//! evict directly, without re-broadcasting.
//!
//! Cache coherence here is a performance property, never a correctness
//! gate: nothing on the commit path returns an error to the caller.

pub mod coordinator;

pub use coordinator::{
    BroadcastListener, InvalidationCoordinator, PendingInvalidation, WorkUnit,
};
