//! Persistent outbound TCP client.
//!
//! Unlike a connect-per-message design, distnode maintains one long-lived
//! connection per peer. Each peer gets its own worker task driving a small
//! state machine: connect, drain a FIFO send queue, detect idle closure,
//! reconnect with backoff. This matches the replication publisher's needs
//! much better than connect-per-send — the publisher fires every 200ms and
//! a fresh handshake on every tick would dominate the wire.
//!
//! # State machine
//!
//! ```text
//! Disconnected --(connect ok)--> Connected
//! Disconnected --(connect err)--> Backoff --(timer)--> Disconnected
//! Connected --(queue non-empty, send ok)--> Connected
//! Connected --(send err)--> Disconnected
//! Connected --(queue empty, peer closed)--> Disconnected
//! Connected --(queue empty, peer alive)--> Connected (after idle sleep)
//! any state + stop signal --> Terminated
//! ```

use distnode_core::config::BackoffMode;
use distnode_core::protocol::{self, Envelope, ProtocolError};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Errors that can occur in the outbound client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("peer already registered: {0}")]
    PeerAlreadyExists(String),

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("payload exceeds max frame size ({size} > {max})")]
    FrameTooLarge { size: usize, max: u32 },
}

/// Tunables controlling every worker spawned by an [`OutboundClient`].
#[derive(Debug, Clone)]
pub struct ClientTunables {
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub max_frame_size: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_mode: BackoffMode,
    pub idle_probe_interval: Duration,
    pub tcp_keepalive: bool,
}

/// A handle to a running per-peer worker: an outbound queue and a stop
/// signal. Dropping the sender half of `stop_tx` is not enough to stop a
/// worker promptly since it may be blocked in a connect/send — we rely on
/// the explicit stop flag checked between operations plus the bounded
/// timeouts on connect/send themselves.
struct PeerHandle {
    queue_tx: mpsc::UnboundedSender<Vec<u8>>,
    stop_tx: mpsc::UnboundedSender<()>,
}

/// Owns one persistent reconnecting worker per known peer.
pub struct OutboundClient {
    tunables: ClientTunables,
    peers: Mutex<HashMap<String, PeerHandle>>,
}

impl OutboundClient {
    pub fn new(tunables: ClientTunables) -> Self {
        Self {
            tunables,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new peer and spawns its worker task. Fails if a worker
    /// for `node_id` already exists.
    pub fn add_peer(&self, node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Result<(), ClientError> {
        let node_id = node_id.into();
        let host = host.into();

        let mut peers = self.peers.lock().expect("client lock poisoned");
        if peers.contains_key(&node_id) {
            return Err(ClientError::PeerAlreadyExists(node_id));
        }

        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (stop_tx, stop_rx) = mpsc::unbounded_channel::<()>();

        let tunables = self.tunables.clone();
        let worker_node_id = node_id.clone();
        tokio::spawn(async move {
            run_worker(worker_node_id, host, port, tunables, queue_rx, stop_rx).await;
        });

        peers.insert(node_id, PeerHandle { queue_tx, stop_tx });
        Ok(())
    }

    /// Returns whether a worker for `node_id` is registered.
    pub fn has_peer(&self, node_id: &str) -> bool {
        let peers = self.peers.lock().expect("client lock poisoned");
        peers.contains_key(node_id)
    }

    /// Stops the worker for `node_id`, if one exists, discarding any
    /// queued-but-unsent frames.
    pub fn remove_peer(&self, node_id: &str) {
        let mut peers = self.peers.lock().expect("client lock poisoned");
        if let Some(handle) = peers.remove(node_id) {
            let _ = handle.stop_tx.send(());
        }
    }

    /// Enqueues an envelope to be sent to `node_id`. Non-blocking. Rejects
    /// the payload up front if it would exceed the configured max frame
    /// size.
    pub fn enqueue(&self, node_id: &str, envelope: &Envelope) -> Result<(), ClientError> {
        let frame = protocol::encode(envelope).map_err(|_| ClientError::FrameTooLarge {
            size: 0,
            max: self.tunables.max_frame_size,
        })?;
        let payload_len = frame.len() - 4;
        if payload_len as u32 > self.tunables.max_frame_size {
            return Err(ClientError::FrameTooLarge {
                size: payload_len,
                max: self.tunables.max_frame_size,
            });
        }

        let peers = self.peers.lock().expect("client lock poisoned");
        let handle = peers
            .get(node_id)
            .ok_or_else(|| ClientError::UnknownPeer(node_id.to_string()))?;
        // send() only fails if the worker task has already exited; the
        // frame is simply dropped in that case, matching the "unsent
        // queued frames may be dropped" ordering guarantee.
        let _ = handle.queue_tx.send(frame);
        Ok(())
    }
}

async fn run_worker(
    node_id: String,
    host: String,
    port: u16,
    tunables: ClientTunables,
    mut queue_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut stop_rx: mpsc::UnboundedReceiver<()>,
) {
    let addr = format!("{host}:{port}");
    let mut backoff = tunables.initial_backoff;
    let mut stream: Option<TcpStream> = None;

    loop {
        if stop_rx.try_recv().is_ok() {
            debug!(peer = %node_id, "worker stopping");
            return;
        }

        if stream.is_none() {
            match timeout(tunables.connect_timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(s)) => {
                    if tunables.tcp_keepalive {
                        // best-effort; socket2-free tokio has no direct keepalive
                        // setter on TcpStream, so this is a documented no-op
                        // placeholder for a platform-specific socket option in a
                        // production build.
                    }
                    debug!(peer = %node_id, %addr, "connected");
                    stream = Some(s);
                    backoff = tunables.initial_backoff;
                }
                Ok(Err(e)) => {
                    warn!(peer = %node_id, %addr, error = %e, "connect failed");
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff, &tunables);
                    continue;
                }
                Err(_) => {
                    warn!(peer = %node_id, %addr, "connect timed out");
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff, &tunables);
                    continue;
                }
            }
        }

        let Some(active) = stream.as_mut() else {
            continue;
        };

        match drain_queue(active, &mut queue_rx, &tunables).await {
            Ok(true) => {}
            Ok(false) => {
                stream = None;
                continue;
            }
            Err(_) => {
                stream = None;
                continue;
            }
        }

        if queue_rx.is_empty() {
            if peer_closed(stream.as_mut().expect("stream present")).await {
                debug!(peer = %node_id, "peer closed while idle");
                stream = None;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(tunables.idle_probe_interval) => {}
                _ = stop_rx.recv() => {
                    debug!(peer = %node_id, "worker stopping");
                    return;
                }
            }
        }
    }
}

/// Sends every currently-queued frame over `stream`. Returns `Ok(true)` if
/// the connection is still usable, `Ok(false)` if a send failed (caller
/// should drop the connection; already-sent frames stay sent, the rest are
/// requeued by simply leaving them in the channel for the next connection
/// — except the channel has already handed them out, so per spec they are
/// dropped rather than requeued).
async fn drain_queue(
    stream: &mut TcpStream,
    queue_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    tunables: &ClientTunables,
) -> Result<bool, ProtocolError> {
    use tokio::io::AsyncWriteExt;

    while let Ok(frame) = queue_rx.try_recv() {
        match timeout(tunables.send_timeout, stream.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "send failed");
                return Ok(false);
            }
            Err(_) => {
                warn!("send timed out");
                return Ok(false);
            }
        }
    }

    if let Err(e) = stream.flush().await {
        warn!(error = %e, "flush failed");
        return Ok(false);
    }

    Ok(true)
}

/// Peeks one byte without consuming it to detect whether the peer has
/// half-closed the connection while we have nothing queued to send.
async fn peer_closed(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match timeout(Duration::from_millis(0), stream.peek(&mut buf)).await {
        Ok(Ok(0)) => true,
        Ok(Ok(_)) => false,
        Ok(Err(_)) => true,
        Err(_) => false,
    }
}

fn next_backoff(current: Duration, tunables: &ClientTunables) -> Duration {
    let next = match tunables.backoff_mode {
        BackoffMode::Linear => current + tunables.initial_backoff,
        BackoffMode::Exponential => current * 2,
    };
    next.min(tunables.max_backoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use distnode_core::protocol::MessageKind;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn test_tunables() -> ClientTunables {
        ClientTunables {
            connect_timeout: Duration::from_millis(200),
            send_timeout: Duration::from_millis(200),
            max_frame_size: protocol::DEFAULT_MAX_FRAME_SIZE,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            backoff_mode: BackoffMode::Exponential,
            idle_probe_interval: Duration::from_millis(50),
            tcp_keepalive: true,
        }
    }

    #[test]
    fn add_peer_rejects_duplicates() {
        let client = OutboundClient::new(test_tunables());
        assert!(client.add_peer("node-2", "127.0.0.1", 1).is_ok());
        assert!(client.add_peer("node-2", "127.0.0.1", 2).is_err());
    }

    #[test]
    fn enqueue_rejects_unknown_peer() {
        let client = OutboundClient::new(test_tunables());
        let envelope = Envelope::new(MessageKind::Ping, "node-1", json!({}));
        assert!(client.enqueue("node-99", &envelope).is_err());
    }

    #[tokio::test]
    async fn worker_delivers_queued_frame_on_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = OutboundClient::new(test_tunables());
        client
            .add_peer("node-2", addr.ip().to_string(), addr.port())
            .unwrap();

        let envelope = Envelope::new(MessageKind::Ping, "node-1", json!({}));
        client.enqueue("node-2", &envelope).unwrap();

        let (mut sock, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();

        let received = timeout(
            Duration::from_secs(2),
            protocol::read_message(&mut sock, protocol::DEFAULT_MAX_FRAME_SIZE),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(received.kind, MessageKind::Ping);
        assert_eq!(received.sender_id, "node-1");
    }
}
