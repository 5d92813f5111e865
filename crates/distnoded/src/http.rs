//! Read-only HTTP snapshot surface.
//!
//! Exposes the state engine's current view over plain HTTP so an operator
//! or dashboard can inspect a node without speaking the TCP wire protocol.
//! This sits outside the replication core entirely — the core and the
//! wire protocol work whether or not this server is running.

use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use distnode_core::state::StateEngine;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
struct HttpState {
    state: Arc<StateEngine>,
}

/// Builds the router: `GET /api/state` and `GET /api/updates`, both
/// carrying `Access-Control-Allow-Origin: *`.
pub fn router(state: Arc<StateEngine>) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/updates", get(get_updates))
        .with_state(HttpState { state })
}

/// Runs the HTTP server on `addr` until the process exits.
pub async fn serve(addr: &str, state: Arc<StateEngine>) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP snapshot surface listening");
    axum::serve(listener, app).await
}

async fn get_state(State(http_state): State<HttpState>) -> Response {
    with_cors(Json(http_state.state.get_state_snapshot()))
}

async fn get_updates(State(http_state): State<HttpState>) -> Response {
    let updates = http_state.state.get_updates_snapshot();
    let body: serde_json::Map<String, serde_json::Value> = updates
        .into_iter()
        .map(|(key, record)| (key, serde_json::to_value(record).unwrap_or(serde_json::Value::Null)))
        .collect();
    with_cors(Json(serde_json::Value::Object(body)))
}

fn with_cors<T: IntoResponse>(body: T) -> Response {
    let mut response = (StatusCode::OK, body).into_response();
    response
        .headers_mut()
        .insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use distnode_core::state::{Record, RecordMeta, Update};
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn state_endpoint_returns_snapshot_with_cors_header() {
        let state = Arc::new(StateEngine::new("self"));
        state.merge_update(Update {
            sensor_id: "s1".to_string(),
            record: Record {
                value: json!(1),
                ts_ms: 100,
                origin: "self".to_string(),
                meta: RecordMeta::default(),
            },
        });

        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/state")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Access-Control-Allow-Origin").unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn updates_endpoint_clears_buffer_after_read() {
        let state = Arc::new(StateEngine::new("self"));
        state.merge_update(Update {
            sensor_id: "s1".to_string(),
            record: Record {
                value: json!(1),
                ts_ms: 100,
                origin: "self".to_string(),
                meta: RecordMeta::default(),
            },
        });

        let app = router(state.clone());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/updates")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.get_updates_snapshot().is_empty());
    }
}
