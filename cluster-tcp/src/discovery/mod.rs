//! Pluggable peer registry: cluster membership is whatever set of addresses
//! has been registered in a shared location. Best-effort only: backends may
//! race across nodes, so register/unregister must be idempotent and tolerate
//! lost updates.

mod directory;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Mutex;

use async_trait::async_trait;

pub use directory::DirectoryDiscovery;

/// The three-method contract the mesh depends on. Backends store addresses
/// however they like (shared filesystem, object storage, ...).
#[async_trait]
pub trait MemberDiscovery: Send + Sync + 'static {
    async fn registered_addresses(&self) -> shared::Result<Vec<SocketAddr>>;

    async fn register_addresses(&self, addrs: &[SocketAddr]) -> shared::Result<()>;

    async fn unregister_addresses(&self, addrs: &[SocketAddr]) -> shared::Result<()>;
}

/// Process-local registry. Only useful when every node shares the process
/// (tests, embedded multi-node setups).
#[derive(Default)]
pub struct InMemoryDiscovery {
    addresses: Mutex<HashSet<SocketAddr>>,
}

impl InMemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemberDiscovery for InMemoryDiscovery {
    async fn registered_addresses(&self) -> shared::Result<Vec<SocketAddr>> {
        Ok(self.addresses.lock().unwrap().iter().copied().collect())
    }

    async fn register_addresses(&self, addrs: &[SocketAddr]) -> shared::Result<()> {
        let mut set = self.addresses.lock().unwrap();
        set.extend(addrs.iter().copied());
        Ok(())
    }

    async fn unregister_addresses(&self, addrs: &[SocketAddr]) -> shared::Result<()> {
        let mut set = self.addresses.lock().unwrap();
        for addr in addrs {
            set.remove(addr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_list_unregister_round_trip() {
        let disco = InMemoryDiscovery::new();
        let a: SocketAddr = "127.0.0.1:9010".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:9020".parse().unwrap();

        disco.register_addresses(&[a, b]).await.unwrap();
        // Duplicate registration must not error or duplicate.
        disco.register_addresses(&[a]).await.unwrap();

        let mut listed = disco.registered_addresses().await.unwrap();
        listed.sort();
        assert_eq!(listed, vec![a, b]);

        disco.unregister_addresses(&[a]).await.unwrap();
        disco.unregister_addresses(&[a]).await.unwrap();
        assert_eq!(disco.registered_addresses().await.unwrap(), vec![b]);
    }
}
