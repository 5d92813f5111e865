//! distnoded — the distnode peer-to-peer replication node.
//!
//! # Architecture
//!
//! The daemon spawns several concurrent tasks:
//! 1. Inbound TCP server (accepts connections, decodes frames, dispatches)
//! 2. Outbound client (one reconnecting worker per known peer)
//! 3. Replication publisher (periodic pump from the state engine)
//! 4. Synthetic sensor sources (feed local updates into the state engine)
//! 5. HTTP snapshot surface (`/api/state`, `/api/updates`)
//!
//! Configuration is entirely environment-driven; see
//! `distnode_core::config::NodeConfig`.

mod client;
mod dispatcher;
mod http;
mod membership;
mod publisher;
mod replication;
mod sensors;
mod server;

use anyhow::{Context, Result};
use client::{ClientTunables, OutboundClient};
use dispatcher::{noop_handler, Dispatcher};
use distnode_core::config::NodeConfig;
use distnode_core::peer::{Peer, PeerTable};
use distnode_core::protocol::{Envelope, MessageKind};
use distnode_core::state::StateEngine;
use membership::{JoinRequestHandler, OnPeerDiscovered, PeerListHandler, Sender};
use server::InboundServer;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::load().context("failed to load configuration from environment")?;
    init_logging(&config);

    info!(node_id = %config.node_id, host = %config.host, port = config.port, "starting distnode");

    let peer_table = Arc::new(PeerTable::new(config.node_id.clone()));
    let state = Arc::new(StateEngine::new(config.node_id.clone()));

    let client = Arc::new(OutboundClient::new(ClientTunables {
        connect_timeout: config.connect_timeout,
        send_timeout: config.send_timeout,
        max_frame_size: config.max_frame_size,
        initial_backoff: config.initial_backoff,
        max_backoff: config.max_backoff,
        backoff_mode: config.backoff_mode,
        idle_probe_interval: config.idle_probe_interval,
        tcp_keepalive: config.tcp_keepalive,
    }));

    let dispatcher = build_dispatcher(&config, peer_table.clone(), client.clone(), state.clone());

    let bind_addr = format!("{}:{}", config.host, config.port);
    let inbound = InboundServer::bind(&bind_addr)
        .await
        .context("failed to start inbound server")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_handle = tokio::spawn({
        let dispatcher = dispatcher.clone();
        let max_frame_size = config.max_frame_size;
        async move {
            inbound.run(dispatcher, max_frame_size, shutdown_rx).await;
        }
    });

    tokio::spawn(publisher::run(
        config.node_id.clone(),
        peer_table.clone(),
        client.clone(),
        state.clone(),
        config.publisher_interval,
    ));

    sensors::spawn_all(
        config.node_id.clone(),
        state.clone(),
        vec![
            Box::new(sensors::NumericSensor::new(
                "temp-1",
                18.0,
                26.0,
                Duration::from_millis(500),
                Some("C".to_string()),
            )),
            Box::new(sensors::BooleanSensor::new("door-1", 0.05, Duration::from_secs(2))),
        ],
    );

    tokio::spawn(http::serve(
        &format!("{}:{}", config.host, config.http_port),
        state.clone(),
    ));

    bootstrap_peers(&config, &peer_table, &client);

    info!("distnode is running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => error!(error = %e, "failed to listen for Ctrl+C"),
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("distnode stopped");
    Ok(())
}

fn build_dispatcher(
    config: &NodeConfig,
    peer_table: Arc<PeerTable>,
    client: Arc<OutboundClient>,
    state: Arc<StateEngine>,
) -> Arc<Dispatcher> {
    let self_node_id = config.node_id.clone();

    let send: Sender = {
        let client = client.clone();
        Arc::new(move |to: &str, envelope: Envelope| {
            if client.enqueue(to, &envelope).is_err() {
                tracing::warn!(peer = to, "failed to send reply: unknown peer");
            }
        })
    };

    let on_peer_discovered: OnPeerDiscovered = {
        let client = client.clone();
        let self_node_id = self_node_id.clone();
        let self_host = config.host.clone();
        let self_port = config.port;
        Arc::new(move |peer: &Peer| {
            if client.add_peer(peer.node_id.clone(), peer.host.clone(), peer.port).is_ok() {
                let join = Envelope::new(
                    MessageKind::JoinRequest,
                    self_node_id.clone(),
                    json!({
                        "node_id": self_node_id,
                        "host": self_host,
                        "port": self_port,
                    }),
                );
                let _ = client.enqueue(&peer.node_id, &join);
            }
        })
    };

    let mut dispatcher = Dispatcher::new();
    dispatcher
        .register(
            MessageKind::JoinRequest,
            JoinRequestHandler::new(peer_table.clone(), send, self_node_id.clone(), on_peer_discovered.clone()),
        )
        .expect("startup: duplicate JOIN_REQUEST handler");
    dispatcher
        .register(MessageKind::PeerList, PeerListHandler::new(peer_table, self_node_id, on_peer_discovered))
        .expect("startup: duplicate PEER_LIST handler");
    dispatcher
        .register(MessageKind::Ping, noop_handler())
        .expect("startup: duplicate PING handler");
    dispatcher
        .register(MessageKind::Pong, noop_handler())
        .expect("startup: duplicate PONG handler");
    dispatcher
        .register(MessageKind::SensorUpdate, replication::SensorUpdateHandler::new(state))
        .expect("startup: duplicate SENSOR_UPDATE handler");

    Arc::new(dispatcher)
}

fn bootstrap_peers(config: &NodeConfig, peer_table: &PeerTable, client: &OutboundClient) {
    for seed in &config.bootstrap_peers {
        let node_id = format!("bootstrap@{}:{}", seed.host, seed.port);
        peer_table.add(Peer::new(node_id.clone(), seed.host.clone(), seed.port));
        if let Err(e) = client.add_peer(node_id.clone(), seed.host.clone(), seed.port) {
            error!(peer = %node_id, error = %e, "failed to register bootstrap peer");
            continue;
        }

        let join = Envelope::new(
            MessageKind::JoinRequest,
            config.node_id.clone(),
            json!({
                "node_id": config.node_id,
                "host": config.host,
                "port": config.port,
            }),
        );
        let _ = client.enqueue(&node_id, &join);
    }
}

/// Initializes the tracing logging infrastructure: an `EnvFilter` seeded
/// from `LOG_LEVEL`, a stderr layer always on, and an optional file layer
/// when `LOG_FILE` is set.
fn init_logging(config: &NodeConfig) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::new(config.log_level.as_tracing_level());

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let file_layer = config.log_file.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
            .map(|file| fmt::layer().with_writer(std::sync::Mutex::new(file)).with_ansi(false))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}
