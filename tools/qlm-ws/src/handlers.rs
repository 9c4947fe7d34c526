// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP and WebSocket request handlers.

use crate::transport;
use crate::{AppState, ClientSlot};
use axum::{
    body::Bytes,
    extract::{ws::WebSocket, Path, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use qlm_core::{ConnectionSession, Datastore, EnvelopeCodec, InfoItem, Object, StoreError};
use std::sync::Arc;
use tracing::{error, warn};

/// GET /qlmws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let Some(slot) = state.try_acquire_client() else {
        warn!("Connection rejected: max clients reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    };

    // A failed upgrade drops the callback, and the slot with it.
    ws.max_message_size(state.config.max_frame_size)
        .on_upgrade(move |socket| handle_socket(socket, state, slot))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, slot: ClientSlot) {
    let session = ConnectionSession::new(state.dispatcher.clone(), state.config.session_config());
    let (source, sink) = transport::split(socket);

    if let Err(e) = session.run(source, sink).await {
        error!("Session error: {}", e);
    }

    drop(slot);
}

/// POST /qlm
pub async fn request_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let reply = state.dispatcher.request_once(&body).await;
    encoded(&state, StatusCode::OK, reply)
}

/// GET /qlm/Objects/
pub async fn node_list(State(state): State<Arc<AppState>>) -> Response {
    let objects: Vec<Object> = state
        .dispatcher
        .store()
        .node_list()
        .into_iter()
        .map(Object::new)
        .collect();
    encode_objects(&state, &objects)
}

/// GET /qlm/Objects/{node}/
pub async fn source_list(
    State(state): State<Arc<AppState>>,
    Path(node): Path<String>,
) -> Response {
    match state.dispatcher.store().source_list(&node) {
        Ok(names) => {
            let object = names
                .into_iter()
                .fold(Object::new(node), |obj, name| obj.with_item(InfoItem::new(name)));
            encode_objects(&state, &[object])
        }
        Err(e @ StoreError::UnknownNode(_)) => {
            (StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let count = state.client_count();
    let stats = state.dispatcher.store().stats();

    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "clients": count,
        "max_clients": state.config.max_clients,
        "nodes": stats.nodes,
        "subscriptions": stats.subscriptions,
        "interval_subscriptions": stats.interval_subscriptions,
        "interval_tasks": state.dispatcher.scheduler().active_count(),
        "dropped_updates": stats.dropped_updates,
    }))
}

fn encode_objects(state: &AppState, objects: &[Object]) -> Response {
    match state.dispatcher.codec().encode_objects(objects) {
        Ok(bytes) => encoded(state, StatusCode::OK, bytes),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn encoded(state: &AppState, status: StatusCode, body: Vec<u8>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, state.dispatcher.codec().content_type())],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use qlm_core::protocol::DataPoint;

    async fn state_with_node() -> Arc<AppState> {
        let state = Arc::new(AppState::new(ServerConfig::default()));
        state
            .dispatcher
            .store()
            .write(
                "n1",
                vec![DataPoint::new("temp", "20"), DataPoint::new("hum", "40")],
            )
            .await
            .unwrap();
        state
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_node_list() {
        let state = state_with_node().await;
        let response = node_list(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, r#"{"objects":[{"id":"n1"}]}"#);
    }

    #[tokio::test]
    async fn test_source_list() {
        let state = state_with_node().await;
        let response = source_list(State(state.clone()), Path("n1".into())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains(r#"{"name":"hum"}"#));
        assert!(body.contains(r#"{"name":"temp"}"#));

        let response = source_list(State(state), Path("ghost".into())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_one_shot_request() {
        let state = state_with_node().await;
        let body = Bytes::from_static(br#"{"read": {"objects": [{"id": "n1", "infoItems": [{"name": "temp"}]}]}}"#);
        let response = request_handler(State(state.clone()), body).await;

        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains("\"returnCode\":200"));
        assert!(text.contains("\"text\":\"20\""));
        assert_eq!(state.dispatcher.store().stats().subscriptions, 0);
    }

    #[tokio::test]
    async fn test_one_shot_malformed() {
        let state = state_with_node().await;
        let response = request_handler(State(state), Bytes::from_static(b"nope")).await;
        assert!(body_text(response).await.contains("\"returnCode\":400"));
    }
}
