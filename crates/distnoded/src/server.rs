//! Inbound TCP server.
//!
//! Listens for incoming connections from other distnode instances. Each
//! accepted connection reads length-prefixed JSON envelopes in a loop and
//! hands every decoded envelope to the shared [`Dispatcher`]. A framing
//! failure or clean EOF closes the connection; a decode failure logs and
//! keeps reading — malformed frames are non-fatal, but a broken connection
//! is.

use crate::dispatcher::Dispatcher;
use distnode_core::protocol::{self, ProtocolError};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Errors that can occur in the inbound server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind TCP listener: {0}")]
    Bind(std::io::Error),
}

/// TCP server accepting connections from other distnode peers.
pub struct InboundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl InboundServer {
    /// Binds a new TCP server to the given address.
    pub async fn bind(addr: &str) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;
        info!(addr = %local_addr, "inbound server listening");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the accept loop until `shutdown` is signalled. Each accepted
    /// connection is handled in its own task, so one slow or malicious peer
    /// can never block the others.
    pub async fn run(
        self,
        dispatcher: Arc<Dispatcher>,
        max_frame_size: u32,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "accepted connection");
                            let dispatcher = dispatcher.clone();
                            let mut conn_shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    result = handle_connection(stream, peer_addr, dispatcher, max_frame_size) => {
                                        if let Err(e) = result {
                                            match e {
                                                ProtocolError::ConnectionClosed => {
                                                    debug!(peer = %peer_addr, "peer disconnected");
                                                }
                                                other => {
                                                    warn!(peer = %peer_addr, error = %other, "connection closed with error");
                                                }
                                            }
                                        }
                                    }
                                    _ = conn_shutdown.changed() => {
                                        debug!(peer = %peer_addr, "connection closed for shutdown");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("inbound server shutting down");
                    return;
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    max_frame_size: u32,
) -> Result<(), ProtocolError> {
    let (mut reader, _writer) = stream.split();

    loop {
        let envelope = match protocol::read_message(&mut reader, max_frame_size).await {
            Ok(envelope) => envelope,
            Err(ProtocolError::Decode(e)) => {
                warn!(peer = %peer_addr, error = %e, "decode failure, continuing connection");
                continue;
            }
            Err(ProtocolError::MalformedEnvelope(reason)) => {
                warn!(peer = %peer_addr, %reason, "malformed envelope, continuing connection");
                continue;
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = dispatcher.dispatch(envelope) {
            warn!(peer = %peer_addr, error = %e, "handler error, continuing connection");
        }
    }
}
