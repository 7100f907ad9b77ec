use std::sync::Mutex;

/// Strategy for determining which tenant partition the calling work-unit is
/// acting for. Consulted on every get/put; the cache engine itself is
/// partition-agnostic and just routes by whatever this returns at call time.
///
/// `None` means "no partition": the lookup goes to the default store.
pub trait PartitionResolver: Send + Sync + 'static {
    fn current_partition(&self) -> Option<String>;
}

/// Single global partition, i.e. partitioning disabled.
#[derive(Default)]
pub struct GlobalPartition;

impl PartitionResolver for GlobalPartition {
    fn current_partition(&self) -> Option<String> {
        None
    }
}

/// Always resolves to one fixed partition. Useful for single-tenant
/// deployments and tests.
pub struct FixedPartition(pub String);

impl PartitionResolver for FixedPartition {
    fn current_partition(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Resolver whose current partition can be switched at runtime, for callers
/// that establish the acting tenant per request.
#[derive(Default)]
pub struct SwitchablePartition {
    current: Mutex<Option<String>>,
}

impl SwitchablePartition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, partition: Option<String>) {
        *self.current.lock().unwrap() = partition;
    }
}

impl PartitionResolver for SwitchablePartition {
    fn current_partition(&self) -> Option<String> {
        self.current.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_partition_resolves_none() {
        assert_eq!(GlobalPartition.current_partition(), None);
    }

    #[test]
    fn fixed_partition_resolves_value() {
        let resolver = FixedPartition("tenantX".to_string());
        assert_eq!(resolver.current_partition(), Some("tenantX".to_string()));
    }

    #[test]
    fn switchable_partition_tracks_updates() {
        let resolver = SwitchablePartition::new();
        assert_eq!(resolver.current_partition(), None);

        resolver.set(Some("p1".to_string()));
        assert_eq!(resolver.current_partition(), Some("p1".to_string()));

        resolver.set(None);
        assert_eq!(resolver.current_partition(), None);
    }
}
