use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::discovery::MemberDiscovery;
use crate::hub::{Hub, InboundHandler};
use crate::peer::PeerConnection;
use crate::protocol::ClusterMessage;
use crate::ClusterConfig;

/// Receives every message the local hub decodes. Listener errors are logged
/// and contained; they never break dispatch to other listeners.
#[async_trait]
pub trait ChannelListener: Send + Sync + 'static {
    async fn on_message(&self, source: Uuid, msg: ClusterMessage) -> shared::Result<()>;
}

/// The sending seam: anything that can broadcast a message to the cluster.
/// Lets callers be tested against a recording stub instead of a live mesh.
pub trait NotificationChannel: Send + Sync + 'static {
    fn send_notification(&self, msg: ClusterMessage);
}

/// One node's view of the full mesh: a hub for receiving plus one
/// [`PeerConnection`] per known peer for sending, wired together through a
/// [`MemberDiscovery`] registry.
pub struct ClusterChannel {
    config: ClusterConfig,
    hub: Hub,
    discovery: Arc<dyn MemberDiscovery>,
    peers: DashMap<SocketAddr, Arc<PeerConnection>>,
    listeners: RwLock<Vec<Arc<dyn ChannelListener>>>,
    local_addr: OnceLock<SocketAddr>,
}

impl ClusterChannel {
    pub fn new(config: ClusterConfig, discovery: Arc<dyn MemberDiscovery>) -> Arc<Self> {
        Arc::new(Self {
            hub: Hub::new(config.clone()),
            config,
            discovery,
            peers: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            local_addr: OnceLock::new(),
        })
    }

    /// Start the hub, advertise our own address in discovery, then dial every
    /// already-registered peer. Returns the hub's bound address.
    pub async fn start(self: &Arc<Self>) -> shared::Result<SocketAddr> {
        let bridge = Arc::new(HubBridge {
            channel: Arc::downgrade(self),
        });
        let bound = self.hub.start(bridge).await?;

        // What peers should dial; differs from the bound address behind NAT.
        let advertised = self.config.advertise_addr.unwrap_or(bound);
        let _ = self.local_addr.set(advertised);
        info!("cluster channel up, advertising {}", advertised);

        self.connect_to_servers().await;
        Ok(bound)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Re-register our address, list discovery and dial every address that is
    /// not self and not already connected. Idempotent; runs again on every
    /// fresh inbound connection so new nodes are picked up without waiting
    /// for a discovery poll.
    pub async fn connect_to_servers(self: &Arc<Self>) {
        self.register_self().await;

        let addrs = match self.discovery.registered_addresses().await {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("failed to list discovery: {}", e);
                return;
            }
        };

        let local = self.local_addr();
        for addr in addrs {
            if Some(addr) == local || self.peers.contains_key(&addr) {
                continue;
            }
            info!("dialing peer {}", addr);
            let weak = Arc::downgrade(self);
            let peer = PeerConnection::connect(
                addr,
                self.config.clone(),
                Box::new(move |lost| {
                    if let Some(channel) = weak.upgrade() {
                        tokio::spawn(async move { channel.peer_lost(lost).await });
                    }
                }),
            );
            self.peers.insert(addr, peer);
        }
    }

    async fn register_self(&self) {
        let Some(addr) = self.local_addr() else {
            return;
        };
        for attempt in 1..=self.config.register_retries {
            match self.discovery.register_addresses(&[addr]).await {
                Ok(()) => return,
                Err(e) => warn!(
                    "failed to register own address ({}/{}): {}",
                    attempt, self.config.register_retries, e
                ),
            }
        }
    }

    /// A peer exceeded its connection attempts: drop it and take its address
    /// out of discovery so other nodes stop dialing it too.
    async fn peer_lost(&self, addr: SocketAddr) {
        if self.peers.remove(&addr).is_some() {
            warn!("removing lost peer {}", addr);
        }
        if let Err(e) = self.discovery.unregister_addresses(&[addr]).await {
            warn!("failed to unregister lost peer {}: {}", addr, e);
        }
    }

    pub async fn register_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.listeners.write().await.push(listener);
    }

    pub fn active_peers(&self) -> Vec<SocketAddr> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    pub async fn stop(&self) {
        self.hub.stop();
        for entry in self.peers.iter() {
            entry.value().stop();
        }
        self.peers.clear();
        if let Some(addr) = self.local_addr() {
            if let Err(e) = self.discovery.unregister_addresses(&[addr]).await {
                warn!("failed to unregister own address: {}", e);
            }
        }
    }

    /// Fan a decoded inbound message out to every listener, in registration
    /// order. One failing listener never starves the rest.
    async fn dispatch(&self, source: Uuid, msg: ClusterMessage) {
        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            if let Err(e) = listener.on_message(source, msg.clone()).await {
                error!("listener failed handling {:?}: {}", msg, e);
            }
        }
    }
}

impl NotificationChannel for ClusterChannel {
    /// Fan out to every known peer. Delivery is handled per peer; a slow or
    /// down peer only delays its own queue.
    fn send_notification(&self, msg: ClusterMessage) {
        for entry in self.peers.iter() {
            entry.value().send_notification(msg.clone());
        }
    }
}

/// Adapter handing hub callbacks to the channel without a reference cycle.
struct HubBridge {
    channel: Weak<ClusterChannel>,
}

#[async_trait]
impl InboundHandler for HubBridge {
    async fn on_connect(&self, session_id: Uuid, remote: SocketAddr) {
        debug!("inbound connection {} from {}", session_id, remote);
        if let Some(channel) = self.channel.upgrade() {
            // A fresh inbound connection often means a node just joined:
            // check discovery now instead of waiting.
            channel.connect_to_servers().await;
        }
    }

    async fn on_message(&self, session_id: Uuid, msg: ClusterMessage) {
        if let Some(channel) = self.channel.upgrade() {
            channel.dispatch(session_id, msg).await;
        }
    }
}
