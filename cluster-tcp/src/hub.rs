use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{frame_codec, ClusterMessage};
use crate::ClusterConfig;

/// Callbacks invoked by the hub's decode path. One decode task per accepted
/// connection; calls for different connections run concurrently.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn on_connect(&self, session_id: Uuid, remote: SocketAddr);
    async fn on_message(&self, session_id: Uuid, msg: ClusterMessage);
}

/// The inbound half of a node's mesh participation: accepts peer connections
/// and dispatches every fully decoded message to the handler.
pub struct Hub {
    config: ClusterConfig,
    sessions: Arc<DashMap<Uuid, SocketAddr>>,
    cancel: CancellationToken,
}

impl Hub {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Bind and start accepting. Returns the actual bound address, which can
    /// differ from the configured one when the port was taken (successive
    /// ports are tried) or when port 0 requested an ephemeral port.
    pub async fn start(&self, handler: Arc<dyn InboundHandler>) -> shared::Result<SocketAddr> {
        let listener = self.bind().await?;
        let local_addr = listener.local_addr()?;
        info!("hub listening on {}", local_addr);

        let sessions = self.sessions.clone();
        let cancel = self.cancel.clone();
        let max_frame_bytes = self.config.max_frame_bytes;
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((socket, remote)) => {
                        socket.set_nodelay(true).ok();
                        let session_id = Uuid::new_v4();
                        sessions.insert(session_id, remote);
                        debug!("hub accepted {} as session {}", remote, session_id);
                        handler.on_connect(session_id, remote).await;

                        let handler = handler.clone();
                        let sessions = sessions.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            process_connection(
                                socket,
                                session_id,
                                handler,
                                cancel,
                                max_frame_bytes,
                            )
                            .await;
                            sessions.remove(&session_id);
                            debug!("session {} closed", session_id);
                        });
                    }
                    Err(e) => {
                        warn!("hub accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            debug!("hub accept loop finished");
        });

        Ok(local_addr)
    }

    /// Try the configured port, then successive ones, a bounded number of
    /// times. Useful when a fixed port is occupied by a co-located node.
    async fn bind(&self) -> shared::Result<TcpListener> {
        let mut last_err = None;
        let attempts = if self.config.port == 0 {
            1
        } else {
            self.config.max_bind_attempts
        };
        for attempt in 0..attempts {
            let port = self.config.port.saturating_add(attempt);
            match TcpListener::bind((self.config.bind_host.as_str(), port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    warn!("hub failed to bind {}:{}: {}", self.config.bind_host, port, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .map(shared::Error::Io)
            .unwrap_or_else(|| shared::Error::Internal("no bind attempts made".to_string())))
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Read length-delimited frames off one peer connection until it closes.
/// A malformed frame is logged and dropped; later frames still get through.
async fn process_connection(
    socket: TcpStream,
    session_id: Uuid,
    handler: Arc<dyn InboundHandler>,
    cancel: CancellationToken,
    max_frame_bytes: usize,
) {
    let mut framed = Framed::new(socket, frame_codec(max_frame_bytes));

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = framed.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!("session {}: read failed: {}", session_id, e);
                break;
            }
            None => break,
        };

        match ClusterMessage::decode(frame.freeze()) {
            Ok(msg) => handler.on_message(session_id, msg).await,
            Err(e) => warn!("session {}: dropping undecodable message: {}", session_id, e),
        }
    }
}
