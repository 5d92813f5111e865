//! Peer identity and the peer table.
//!
//! A `Peer` is a remote node's identity and network endpoint. The
//! `PeerTable` is the local node's view of the cluster: insertion-only in
//! the hot path, keyed by `node_id`, with self-insertion always a no-op.
//!
//! # Design Pattern: single lock
//!
//! All reads and writes go through one `Mutex`. There is no fine-grained
//! locking here because the table is small (one entry per cluster member)
//! and mutations are rare compared to the message traffic that flows
//! through the rest of the node.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Liveness status of a peer. Only `Alive` is produced by the core; the
/// other variants exist so the type can be extended by a future failure
/// detector without changing the wire shape. Cosmetic only — nothing in
/// the replication path branches on `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Alive,
    Suspected,
    Dead,
}

/// A known remote node: identity plus the endpoint used to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub last_heartbeat: f64,
    pub phi: f64,
    pub status: PeerStatus,
}

impl Peer {
    /// Creates a fresh peer entry, stamping `last_heartbeat` at construction
    /// time and defaulting to `Alive`. Mirrors the original node's
    /// `Peer.new` factory.
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let last_heartbeat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            last_heartbeat,
            phi: 0.0,
            status: PeerStatus::Alive,
        }
    }

    /// Returns `host:port`, useful for dialing the peer over TCP.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Thread-safe table of known peers, keyed by `node_id`.
///
/// Invariant: the table never stores an entry whose `node_id` equals the
/// owning node's id. Invariant: `add` returns `true` exactly once per
/// `node_id`; every subsequent call for the same id returns `false`.
pub struct PeerTable {
    self_node_id: String,
    peers: Mutex<HashMap<String, Peer>>,
}

impl PeerTable {
    pub fn new(self_node_id: impl Into<String>) -> Self {
        Self {
            self_node_id: self_node_id.into(),
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn self_node_id(&self) -> &str {
        &self.self_node_id
    }

    /// Adds `peer` if it is not the local node and not already present.
    ///
    /// Returns `true` if the peer was newly added, `false` otherwise
    /// (self-insertion or already-known — no mutation in either case).
    pub fn add(&self, peer: Peer) -> bool {
        if peer.node_id == self.self_node_id {
            return false;
        }

        let mut peers = self.peers.lock().expect("peer table lock poisoned");
        if peers.contains_key(&peer.node_id) {
            return false;
        }
        peers.insert(peer.node_id.clone(), peer);
        true
    }

    /// Returns a copy of the peer with the given id, if known.
    pub fn get(&self, node_id: &str) -> Option<Peer> {
        let peers = self.peers.lock().expect("peer table lock poisoned");
        peers.get(node_id).cloned()
    }

    /// Returns a snapshot of all known peers, safe for concurrent iteration.
    pub fn list_snapshot(&self) -> Vec<Peer> {
        let peers = self.peers.lock().expect("peer table lock poisoned");
        peers.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_insertion_is_a_no_op() {
        let table = PeerTable::new("node-1");
        let added = table.add(Peer::new("node-1", "127.0.0.1", 9000));
        assert!(!added);
        assert!(table.list_snapshot().is_empty());
    }

    #[test]
    fn add_is_idempotent_per_node_id() {
        let table = PeerTable::new("node-1");
        assert!(table.add(Peer::new("node-2", "127.0.0.1", 9001)));
        assert!(!table.add(Peer::new("node-2", "127.0.0.1", 9002)));
        assert_eq!(table.list_snapshot().len(), 1);
        // the first insertion wins; the second attempt does not overwrite
        assert_eq!(table.get("node-2").unwrap().port, 9001);
    }

    #[test]
    fn get_returns_none_for_unknown_peer() {
        let table = PeerTable::new("node-1");
        assert!(table.get("node-99").is_none());
    }

    #[test]
    fn list_snapshot_reflects_insertions() {
        let table = PeerTable::new("node-1");
        table.add(Peer::new("node-2", "127.0.0.1", 9001));
        table.add(Peer::new("node-3", "127.0.0.1", 9002));
        let mut ids: Vec<String> = table.list_snapshot().into_iter().map(|p| p.node_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["node-2".to_string(), "node-3".to_string()]);
    }
}
