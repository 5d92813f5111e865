//! Replication publisher.
//!
//! A periodic task that drains the state engine's replication buffer and
//! ships every locally-originated update to every known peer. Filtering on
//! `origin == self_node_id` is what keeps the cluster loop-free: each node
//! only ever re-broadcasts updates it produced itself, never updates it
//! received from someone else.

use distnode_core::peer::PeerTable;
use distnode_core::protocol::{Envelope, MessageKind};
use distnode_core::state::StateEngine;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::client::OutboundClient;

/// Runs the publisher loop until the process exits. Intended to be spawned
/// as its own task and never joined under normal operation.
pub async fn run(
    self_node_id: String,
    peer_table: Arc<PeerTable>,
    client: Arc<OutboundClient>,
    state: Arc<StateEngine>,
    interval: Duration,
) {
    loop {
        publish_once(&self_node_id, &peer_table, &client, &state);
        tokio::time::sleep(interval).await;
    }
}

fn publish_once(
    self_node_id: &str,
    peer_table: &PeerTable,
    client: &OutboundClient,
    state: &StateEngine,
) {
    let updates = state.pop_replication_updates();
    if updates.is_empty() {
        return;
    }

    let peers = peer_table.list_snapshot();

    for (key, record) in updates {
        if record.origin != self_node_id {
            continue;
        }

        // key is "<origin>:<sensor_id>"; strip the origin prefix we just
        // verified matches this node to recover the bare sensor_id.
        let sensor_id = key
            .strip_prefix(&format!("{}:", record.origin))
            .unwrap_or(&key)
            .to_string();

        let envelope = Envelope::new(
            MessageKind::SensorUpdate,
            self_node_id,
            json!({
                "sensor_id": sensor_id,
                "value": record.value,
                "ts_ms": record.ts_ms,
                "origin": record.origin,
                "meta": record.meta,
            }),
        );

        for peer in &peers {
            send_to_peer(client, peer, &envelope);
        }
    }
}

fn send_to_peer(client: &OutboundClient, peer: &distnode_core::peer::Peer, envelope: &Envelope) {
    if client.enqueue(&peer.node_id, envelope).is_ok() {
        return;
    }

    // Just-in-time registration: the peer table knew about this peer before
    // the outbound client did. Register once and retry; if that also fails,
    // log and move on — the next publisher tick will try again.
    if let Err(e) = client.add_peer(peer.node_id.clone(), peer.host.clone(), peer.port) {
        warn!(peer = %peer.node_id, error = %e, "failed to register peer for SENSOR_UPDATE");
        return;
    }

    if let Err(e) = client.enqueue(&peer.node_id, envelope) {
        warn!(peer = %peer.node_id, error = %e, "failed to send SENSOR_UPDATE after registering peer");
    }
}
