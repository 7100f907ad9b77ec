//! Self-discovering peer-to-peer TCP mesh.
//!
//! Every node plays both roles: a [`hub::Hub`] accepts inbound connections
//! and decodes messages from peers, and one [`peer::PeerConnection`] per
//! known peer pushes outbound messages. [`channel::ClusterChannel`] composes
//! the two into a single logical full-mesh channel, using a
//! [`discovery::MemberDiscovery`] registry to find peers and to advertise
//! this node's own address.
//!
//! Delivery is best-effort: no acknowledgements, no deduplication, FIFO only
//! per peer and only while a connection stays up.

pub mod channel;
pub mod discovery;
pub mod hub;
pub mod peer;
pub mod protocol;

use std::net::SocketAddr;
use std::time::Duration;

pub use channel::{ChannelListener, ClusterChannel, NotificationChannel};
pub use discovery::{DirectoryDiscovery, InMemoryDiscovery, MemberDiscovery};
pub use hub::{Hub, InboundHandler};
pub use peer::PeerConnection;
pub use protocol::ClusterMessage;

/// Mesh tuning knobs. Defaults suit production; tests shrink the timings.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub bind_host: String,
    pub port: u16,
    /// Address advertised to peers instead of the bound one (NAT setups).
    pub advertise_addr: Option<SocketAddr>,
    /// How many successive ports to try when the configured one is taken.
    pub max_bind_attempts: u16,
    pub connect_timeout: Duration,
    /// How often the peer monitor checks connectivity.
    pub poll_interval: Duration,
    /// Consecutive failed connect attempts before a peer is declared lost.
    pub max_connect_attempts: u32,
    /// Attempts at registering our own address with discovery.
    pub register_retries: u32,
    pub max_frame_bytes: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: 5700,
            advertise_addr: None,
            max_bind_attempts: 10,
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            max_connect_attempts: 3,
            register_retries: 3,
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

impl ClusterConfig {
    pub fn from_config(config: &shared::config::Config) -> Self {
        Self {
            bind_host: config.host.clone(),
            port: config.port,
            advertise_addr: config.advertise_addr,
            ..Self::default()
        }
    }
}
