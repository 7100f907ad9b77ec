use std::net::SocketAddr;
use std::sync::Arc;

use futures::SinkExt;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::timeout;
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{frame_codec, ClusterMessage};
use crate::ClusterConfig;

/// Invoked once when a peer is declared permanently lost.
pub type LostConnectionCallback = Box<dyn FnOnce(SocketAddr) + Send + 'static>;

type Sink = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// Connection state shared between the sender and monitor loops. The monitor
/// establishes the sink; the sender uses it and clears it on write failure.
struct Link {
    sink: Mutex<Option<Sink>>,
    connected: Notify,
}

/// The outbound half of mesh participation: one instance per known peer,
/// pushing this node's messages to that peer's hub.
///
/// Messages are queued without bound and delivered FIFO by a sender task.
/// A monitor task polls connectivity and reconnects when down; after too many
/// consecutive failed attempts the connection declares itself lost, fires the
/// callback and stops both tasks. Queued-but-unsent messages die with it.
pub struct PeerConnection {
    addr: SocketAddr,
    queue_tx: mpsc::UnboundedSender<ClusterMessage>,
    cancel: CancellationToken,
}

impl PeerConnection {
    pub fn connect(
        addr: SocketAddr,
        config: ClusterConfig,
        on_lost: LostConnectionCallback,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let link = Arc::new(Link {
            sink: Mutex::new(None),
            connected: Notify::new(),
        });

        tokio::spawn(sender_loop(
            queue_rx,
            link.clone(),
            cancel.clone(),
            config.clone(),
        ));
        tokio::spawn(monitor_loop(addr, link, cancel.clone(), config, on_lost));

        Arc::new(Self {
            addr,
            queue_tx,
            cancel,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Enqueue a message; never blocks the caller. The network write happens
    /// asynchronously, retried for as long as this connection is alive.
    pub fn send_notification(&self, msg: ClusterMessage) {
        let _ = self.queue_tx.send(msg);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Takes the next queued message and writes it once a connection is up.
/// While disconnected it waits rather than dropping, so messages queued
/// across an outage go out in order after reconnect.
async fn sender_loop(
    mut queue_rx: mpsc::UnboundedReceiver<ClusterMessage>,
    link: Arc<Link>,
    cancel: CancellationToken,
    config: ClusterConfig,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = queue_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let frame = msg.encode();

        loop {
            let wrote = {
                let mut guard = link.sink.lock().await;
                match guard.as_mut() {
                    Some(sink) => match sink.send(frame.clone()).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("write to peer failed, marking link down: {}", e);
                            *guard = None;
                            false
                        }
                    },
                    None => false,
                }
            };
            if wrote {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = link.connected.notified() => {}
                // Poll fallback in case the connect notification raced us.
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        }
    }
    debug!("peer sender loop finished");
}

/// Polls connectivity once per interval and (re)connects when down, each
/// attempt bounded by the connect timeout. While connected it watches the
/// read half: the hub never sends us anything, so readable-EOF means the
/// peer went away. Gives up for good after `max_connect_attempts`
/// consecutive failures.
async fn monitor_loop(
    addr: SocketAddr,
    link: Arc<Link>,
    cancel: CancellationToken,
    config: ClusterConfig,
    on_lost: LostConnectionCallback,
) {
    let mut failures = 0u32;
    let mut read_half: Option<OwnedReadHalf> = None;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let down = link.sink.lock().await.is_none();
        if down {
            read_half = None;
            match timeout(config.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true).ok();
                    let (reader, writer) = stream.into_split();
                    *link.sink.lock().await =
                        Some(FramedWrite::new(writer, frame_codec(config.max_frame_bytes)));
                    read_half = Some(reader);
                    failures = 0;
                    info!("connected to peer {}", addr);
                    link.connected.notify_waiters();
                }
                _ => {
                    failures += 1;
                    warn!(
                        "failed to connect to peer {} ({}/{})",
                        addr, failures, config.max_connect_attempts
                    );
                    if failures >= config.max_connect_attempts {
                        warn!("peer {} declared lost", addr);
                        cancel.cancel();
                        on_lost(addr);
                        break;
                    }
                }
            }
        }

        match read_half.as_mut() {
            Some(reader) => {
                let mut buf = [0u8; 64];
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    read = reader.read(&mut buf) => match read {
                        // EOF or error: the remote hub is gone.
                        Ok(0) | Err(_) => {
                            warn!("peer {} closed the connection", addr);
                            *link.sink.lock().await = None;
                            read_half = None;
                        }
                        Ok(_) => {}
                    },
                }
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
        }
    }
    debug!("peer monitor loop finished for {}", addr);
}
