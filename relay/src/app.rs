//! HTTP surface of the relay: the agent handshake, the public proxy and the
//! operational endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use burrow_shared::protocol::MAX_MESSAGE_SIZE;
use burrow_shared::ErrorKind;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::config::{HandshakePolicy, RelayConfig};
use crate::headers::HeaderRewriter;
use crate::metrics::Metrics;
use crate::proxy::proxy_handler;
use crate::reader;
use crate::tunnel::{self, ConnectionId, TunnelConnection, TunnelManager, TunnelState};

/// How long a finished session waits for its writer to flush the close frame
const WRITER_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub tunnels: Arc<TunnelManager>,
    pub config: Arc<RelayConfig>,
    pub metrics: Metrics,
    pub rewriter: Arc<HeaderRewriter>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            tunnels: Arc::new(TunnelManager::new(config.handshake_policy)),
            rewriter: Arc::new(HeaderRewriter::new(config.forwarded_headers)),
            metrics: Metrics::new(),
            config: Arc::new(config),
        }
    }
}

/// Routes: the handshake path, `/_burrow/*`, and everything else proxied.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&state.config.tunnel_path, get(ws_handler))
        .route("/_burrow/health", get(|| async { "OK" }))
        .route("/_burrow/status", get(status_handler))
        .route("/_burrow/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.tunnels.would_reject() {
        warn!("Refusing agent handshake, another agent is connected");
        return (StatusCode::CONFLICT, "An agent is already connected").into_response();
    }
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = state.tunnels.next_connection_id();
    run_session(socket, state, conn_id)
        .instrument(info_span!("tunnel", conn_id))
        .await
}

/// Drive one agent connection from install to release.
async fn run_session(mut socket: WebSocket, state: AppState, conn_id: ConnectionId) {
    let (conn, outbound) = TunnelConnection::new(conn_id);

    // Reject can still trip here if two handshakes raced past ws_handler
    if let Err(e) = state.tunnels.install(conn.clone()) {
        warn!("Refusing agent: {}", e);
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: e.to_string().into(),
            })))
            .await;
        return;
    }
    state.metrics.tunnel_opened();
    info!("Agent connected");

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(tunnel::write_loop(sink, outbound, conn.clone()).in_current_span());

    let exit = reader::read_loop(&mut stream, &conn, state.config.idle_timeout()).await;

    conn.teardown(ErrorKind::Transport, &exit.to_string());
    state.tunnels.release(&conn);
    state.metrics.tunnel_closed();

    if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        warn!("Tunnel writer did not stop in time, aborting");
        writer.abort();
    }
    info!(%exit, "Agent disconnected");
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    state: TunnelState,
    handshake_policy: HandshakePolicy,
    connection_id: Option<ConnectionId>,
    connected_since: Option<DateTime<Utc>>,
    pending_requests: usize,
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let current = state.tunnels.current();
    Json(StatusResponse {
        state: state.tunnels.state(),
        handshake_policy: state.tunnels.policy(),
        connection_id: current.as_ref().map(|c| c.id()),
        connected_since: current.as_ref().map(|c| c.connected_at()),
        pending_requests: current.as_ref().map_or(0, |c| c.pending()),
    })
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let current = state.tunnels.current();
    let body = state
        .metrics
        .to_prometheus(current.is_some(), current.map_or(0, |c| c.pending()))
        .await;
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
