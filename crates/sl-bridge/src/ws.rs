use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, StatusCode},
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;

use sl_telemetry::metrics::global_metrics;
use sl_telemetry::tracing_setup::request_id_middleware;

use crate::auth::AuthError;
use crate::hub::Hub;
use crate::protocol::Frame;
use crate::transport::{ProxyTransport, Result, TransportError, TransportKind};
use crate::ws_client::{NODE_PATH, OBSERVER_PATH};

#[derive(Debug, Deserialize)]
pub struct HandshakeQuery {
    pub access_token: Option<String>,
}

/// Router exposing the hub's realtime endpoints plus `/health` and `/metrics`.
pub fn hub_router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route(NODE_PATH, get(node_ws))
        .route(OBSERVER_PATH, get(observer_ws))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

fn unauthorized(e: AuthError) -> axum::response::Response {
    tracing::warn!(error = %e, "handshake rejected");
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "unauthorized", "reason": e.to_string()})),
    )
        .into_response()
}

/// GET /hub/node?access_token=…: node connection. The token must carry a
/// `nodeId` claim; otherwise the upgrade is refused with 401.
async fn node_ws(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub>>,
    Query(query): Query<HandshakeQuery>,
) -> impl IntoResponse {
    let node_id = match hub.authenticate_node(query.access_token.as_deref()) {
        Ok(id) => id,
        Err(e) => return unauthorized(e),
    };
    ws.on_upgrade(move |socket| hub.serve_node(node_id, Box::new(ServerWsTransport::new(socket))))
        .into_response()
}

/// GET /hub/observer?access_token=…: dashboard connection.
async fn observer_ws(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub>>,
    Query(query): Query<HandshakeQuery>,
) -> impl IntoResponse {
    let claims = match hub.authenticate_observer(query.access_token.as_deref()) {
        Ok(c) => c,
        Err(e) => return unauthorized(e),
    };
    ws.on_upgrade(move |socket| {
        hub.serve_observer(claims, Box::new(ServerWsTransport::new(socket)))
    })
    .into_response()
}

async fn health(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    let outbox = match hub.outbox().count_by_status().await {
        Ok(counts) => serde_json::to_value(counts).unwrap_or_default(),
        Err(e) => serde_json::json!({"error": e.to_string()}),
    };
    Json(serde_json::json!({
        "status": "ok",
        "hub_id": hub.hub_id(),
        "nodes": hub.connections().node_statuses(),
        "observers_online": hub.connections().observer_count(),
        "outbox": outbox,
    }))
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        global_metrics().export_prometheus(),
    )
}

/// Server half of an upgraded websocket.
pub struct ServerWsTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
}

impl ServerWsTransport {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

#[async_trait]
impl ProxyTransport for ServerWsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        let text = frame
            .encode()
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Result<Frame> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Frame::decode(text.as_str())
                        .map_err(|e| TransportError::Serialization(e.to_string()));
                }
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::ConnectionClosed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}
