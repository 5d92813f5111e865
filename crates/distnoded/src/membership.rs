//! Membership protocol: JOIN_REQUEST / PEER_LIST handlers.
//!
//! A node joins the cluster by sending `JOIN_REQUEST` to its bootstrap
//! peers. The receiving node adds the joiner to its peer table and replies
//! with `PEER_LIST`, its full view of the cluster. The joiner integrates
//! every peer it didn't already know and, transitively, sends its own
//! `JOIN_REQUEST` to each of them — this is what grows a static seed list
//! into a fully connected mesh.

use crate::dispatcher::{Handler, HandlerError};
use distnode_core::peer::{Peer, PeerTable};
use distnode_core::protocol::{Envelope, MessageKind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct JoinRequestPayload {
    node_id: String,
    host: String,
    port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct PeerEntry {
    node_id: String,
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct PeerListPayload {
    peers: Vec<PeerEntry>,
}

/// Callback invoked whenever a peer is newly added to the table — wires
/// the new peer into the outbound client and sends it a transitive
/// `JOIN_REQUEST`. Errors are logged, never propagated: a failure to reach
/// one freshly-discovered peer must not abort processing the rest.
pub type OnPeerDiscovered = Arc<dyn Fn(&Peer) + Send + Sync>;

/// Callback used to address a reply to the envelope's transport-level
/// sender (an opaque connection identifier the caller supplies, e.g. the
/// sender's `node_id` registered for the connection that produced the
/// envelope).
pub type Sender = Arc<dyn Fn(&str, Envelope) + Send + Sync>;

/// Handles `JOIN_REQUEST`: adds the joiner to the peer table (if new,
/// possibly rewriting `0.0.0.0` to the advertised `node_id`) and always
/// replies `PEER_LIST` to the envelope's transport sender — never to the
/// payload's advertised `node_id`, which may differ (e.g. behind NAT).
pub struct JoinRequestHandler {
    peer_table: Arc<PeerTable>,
    send: Sender,
    self_node_id: String,
    on_peer_discovered: OnPeerDiscovered,
}

impl JoinRequestHandler {
    pub fn new(
        peer_table: Arc<PeerTable>,
        send: Sender,
        self_node_id: impl Into<String>,
        on_peer_discovered: OnPeerDiscovered,
    ) -> Self {
        Self {
            peer_table,
            send,
            self_node_id: self_node_id.into(),
            on_peer_discovered,
        }
    }
}

impl Handler for JoinRequestHandler {
    fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        let payload: JoinRequestPayload = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| HandlerError(format!("invalid JOIN_REQUEST payload: {e}")))?;

        if payload.node_id.is_empty() {
            warn!(sender = %envelope.sender_id, "JOIN_REQUEST with empty node_id, ignoring");
            return Ok(());
        }

        if payload.node_id == self.self_node_id {
            return Ok(());
        }

        // A joiner behind a NAT/container may advertise 0.0.0.0 as its own
        // host. That is never dialable, so we substitute the advertised
        // node_id as a DNS-resolvable stand-in. This is a documented
        // assumption, not a general NAT traversal mechanism.
        let host = if payload.host == "0.0.0.0" {
            payload.node_id.clone()
        } else {
            payload.host.clone()
        };

        let peer = Peer::new(payload.node_id.clone(), host, payload.port);
        let added = self.peer_table.add(peer.clone());

        if added {
            info!(node_id = %payload.node_id, host = %peer.host, port = peer.port, "new peer joined");
            (self.on_peer_discovered)(&peer);
        } else {
            info!(node_id = %payload.node_id, "JOIN_REQUEST from known peer");
        }

        let peers_payload: Vec<PeerEntry> = self
            .peer_table
            .list_snapshot()
            .into_iter()
            .map(|p| PeerEntry {
                node_id: p.node_id,
                host: p.host,
                port: p.port,
            })
            .collect();

        let reply = Envelope::new(
            MessageKind::PeerList,
            self.self_node_id.clone(),
            json!({ "peers": peers_payload }),
        );

        (self.send)(&envelope.sender_id, reply);
        Ok(())
    }
}

/// Handles `PEER_LIST`: integrates every advertised peer not already
/// known. Never replies.
pub struct PeerListHandler {
    peer_table: Arc<PeerTable>,
    self_node_id: String,
    on_peer_discovered: OnPeerDiscovered,
}

impl PeerListHandler {
    pub fn new(
        peer_table: Arc<PeerTable>,
        self_node_id: impl Into<String>,
        on_peer_discovered: OnPeerDiscovered,
    ) -> Self {
        Self {
            peer_table,
            self_node_id: self_node_id.into(),
            on_peer_discovered,
        }
    }
}

impl Handler for PeerListHandler {
    fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        let payload: PeerListPayload = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| HandlerError(format!("invalid PEER_LIST payload: {e}")))?;

        let mut added_count = 0;
        for entry in payload.peers {
            if entry.node_id == self.self_node_id || entry.node_id.is_empty() {
                continue;
            }
            let peer = Peer::new(entry.node_id, entry.host, entry.port);
            if self.peer_table.add(peer.clone()) {
                added_count += 1;
                (self.on_peer_discovered)(&peer);
            }
        }

        if added_count > 0 {
            info!(added_count, "integrated new peers from PEER_LIST");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn join_request_ignores_self() {
        let peer_table = Arc::new(PeerTable::new("self"));
        let sent: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let sent_clone = sent.clone();
        let send: Sender = Arc::new(move |to, _env| sent_clone.lock().unwrap().push(to.to_string()));
        let discovered = Arc::new(AtomicUsize::new(0));
        let discovered_clone = discovered.clone();
        let on_discovered: OnPeerDiscovered = Arc::new(move |_p| {
            discovered_clone.fetch_add(1, Ordering::SeqCst);
        });

        let handler = JoinRequestHandler::new(peer_table, send, "self", on_discovered);
        let envelope = Envelope::new(
            MessageKind::JoinRequest,
            "self",
            json!({"node_id": "self", "host": "127.0.0.1", "port": 9000}),
        );
        handler.handle(envelope).unwrap();

        assert_eq!(discovered.load(Ordering::SeqCst), 0);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn join_request_ignores_empty_node_id() {
        let peer_table = Arc::new(PeerTable::new("self"));
        let sent: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let sent_clone = sent.clone();
        let send: Sender = Arc::new(move |to, _env| sent_clone.lock().unwrap().push(to.to_string()));
        let discovered = Arc::new(AtomicUsize::new(0));
        let discovered_clone = discovered.clone();
        let on_discovered: OnPeerDiscovered = Arc::new(move |_p| {
            discovered_clone.fetch_add(1, Ordering::SeqCst);
        });

        let handler = JoinRequestHandler::new(peer_table.clone(), send, "self", on_discovered);
        let envelope = Envelope::new(
            MessageKind::JoinRequest,
            "transport-sender-id",
            json!({"node_id": "", "host": "127.0.0.1", "port": 9000}),
        );
        handler.handle(envelope).unwrap();

        assert_eq!(discovered.load(Ordering::SeqCst), 0);
        assert!(sent.lock().unwrap().is_empty());
        assert_eq!(peer_table.list_snapshot().len(), 0);
    }

    #[test]
    fn join_request_adds_peer_and_replies_to_transport_sender() {
        let peer_table = Arc::new(PeerTable::new("self"));
        let sent: Arc<StdMutex<Vec<(String, Envelope)>>> = Arc::new(StdMutex::new(Vec::new()));
        let sent_clone = sent.clone();
        let send: Sender = Arc::new(move |to, env| sent_clone.lock().unwrap().push((to.to_string(), env)));
        let on_discovered: OnPeerDiscovered = Arc::new(|_p| {});

        let handler = JoinRequestHandler::new(peer_table.clone(), send, "self", on_discovered);
        let envelope = Envelope::new(
            MessageKind::JoinRequest,
            "transport-sender-id",
            json!({"node_id": "node-2", "host": "127.0.0.1", "port": 9001}),
        );
        handler.handle(envelope).unwrap();

        assert!(peer_table.get("node-2").is_some());
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "transport-sender-id");
        assert_eq!(sent[0].1.kind, MessageKind::PeerList);
    }

    #[test]
    fn zero_zero_zero_zero_host_is_rewritten_to_node_id() {
        let peer_table = Arc::new(PeerTable::new("self"));
        let send: Sender = Arc::new(|_to, _env| {});
        let on_discovered: OnPeerDiscovered = Arc::new(|_p| {});

        let handler = JoinRequestHandler::new(peer_table.clone(), send, "self", on_discovered);
        let envelope = Envelope::new(
            MessageKind::JoinRequest,
            "node-2",
            json!({"node_id": "node-2", "host": "0.0.0.0", "port": 9001}),
        );
        handler.handle(envelope).unwrap();

        let peer = peer_table.get("node-2").unwrap();
        assert_eq!(peer.host, "node-2");
    }

    #[test]
    fn peer_list_integrates_unknown_peers_only() {
        let peer_table = Arc::new(PeerTable::new("self"));
        peer_table.add(Peer::new("node-2", "127.0.0.1", 9001));

        let discovered = Arc::new(AtomicUsize::new(0));
        let discovered_clone = discovered.clone();
        let on_discovered: OnPeerDiscovered = Arc::new(move |_p| {
            discovered_clone.fetch_add(1, Ordering::SeqCst);
        });

        let handler = PeerListHandler::new(peer_table.clone(), "self", on_discovered);
        let envelope = Envelope::new(
            MessageKind::PeerList,
            "node-2",
            json!({"peers": [
                {"node_id": "node-2", "host": "127.0.0.1", "port": 9001},
                {"node_id": "node-3", "host": "127.0.0.1", "port": 9002},
                {"node_id": "self", "host": "127.0.0.1", "port": 9999},
            ]}),
        );
        handler.handle(envelope).unwrap();

        assert_eq!(discovered.load(Ordering::SeqCst), 1);
        assert!(peer_table.get("node-3").is_some());
    }
}
