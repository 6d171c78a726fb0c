//! Ingress adapter: forwards public HTTP requests through the tunnel.

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header::HOST, Request, StatusCode},
    response::{IntoResponse, Response},
};
use burrow_shared::protocol::{IncomingMessage, OutgoingMessage};
use burrow_shared::{Error, ErrorKind, Result};
use hyper::header::HeaderValue;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::correlator::Waiter;
use crate::headers::HeaderRewriter;
use crate::metrics::{Metrics, Outcome};
use crate::tunnel::TunnelConnection;

/// Response header carrying the stable error code on gateway failures
pub const ERROR_HEADER: &str = "x-burrow-error";

/// Fresh tokens tried before giving up on a colliding correlation id
const MAX_ID_ATTEMPTS: usize = 3;

pub async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let started = Instant::now();
    let (parts, body) = req.into_parts();

    let host = parts
        .headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let method = parts.method.to_string();

    let body = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(b) => b.to_vec(),
        Err(e) => {
            warn!(%method, %path, "Failed to read request body: {}", e);
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large or unreadable").into_response();
        }
    };
    let bytes_in = body.len() as u64;

    // No agent: fail now rather than park the caller
    let Some(conn) = state.tunnels.current() else {
        warn!(%method, %path, "No agent connected");
        state
            .metrics
            .record_request(Outcome::NoAgent, elapsed_us(started), bytes_in, 0)
            .await;
        return gateway_error(&Error::NotConnected);
    };

    let mut message = OutgoingMessage {
        conversation_id: String::new(),
        protocol: format!("{:?}", parts.version),
        headers: state
            .rewriter
            .rewrite_request(&parts.headers, Some(&peer.ip().to_string()), &host),
        host,
        path,
        method,
        content_length: body.len() as i64,
        body,
    };

    let waiter = match register(&conn, &mut message, || Uuid::new_v4().to_string()) {
        Ok(waiter) => waiter,
        Err(err) => {
            warn!(conn_id = conn.id(), "Could not register request: {}", err);
            state
                .metrics
                .record_request(classify(&err), elapsed_us(started), bytes_in, 0)
                .await;
            return gateway_error(&err);
        }
    };
    debug!(
        conn_id = conn.id(),
        conversation_id = %waiter.id(),
        method = %message.method,
        path = %message.path,
        "Forwarding request"
    );

    // Dropping this future (caller hung up) drops the waiter, which clears
    // its table entry; the frame already sent is not retracted.
    let abandoned = Abandoned::new(&state.metrics, bytes_in);
    let exchange = async {
        conn.send(&message).await?;
        waiter.wait().await
    };
    let result = match tokio::time::timeout(state.config.request_timeout(), exchange).await {
        Ok(result) => result.and_then(|reply| match reply.error() {
            Some(err) => Err(err),
            None => Ok(reply),
        }),
        Err(_) => Err(Error::Timeout),
    };
    abandoned.disarm();

    let (response, outcome, bytes_out) = match result {
        Ok(reply) => {
            let bytes_out = reply.body.len() as u64;
            (relay_response(&state.rewriter, reply), Outcome::Proxied, bytes_out)
        }
        Err(err) => {
            warn!(
                conversation_id = %message.conversation_id,
                kind = %err.kind(),
                "Request failed: {}", err
            );
            (gateway_error(&err), classify(&err), 0)
        }
    };

    info!(
        conversation_id = %message.conversation_id,
        method = %message.method,
        path = %message.path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "Request completed"
    );
    state
        .metrics
        .record_request(outcome, elapsed_us(started), bytes_in, bytes_out)
        .await;
    response
}

/// Counts the request as `client_closed` if the handler is dropped while
/// waiting on the agent.
struct Abandoned<'a> {
    metrics: &'a Metrics,
    bytes_in: u64,
    armed: bool,
}

impl<'a> Abandoned<'a> {
    fn new(metrics: &'a Metrics, bytes_in: u64) -> Self {
        Self {
            metrics,
            bytes_in,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Abandoned<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Caller went away before the agent replied");
            self.metrics.record_outcome(Outcome::ClientClosed, self.bytes_in, 0);
        }
    }
}

/// Register `message` under a fresh token, retrying on collisions.
fn register(
    conn: &TunnelConnection,
    message: &mut OutgoingMessage,
    mut next_id: impl FnMut() -> String,
) -> Result<Waiter> {
    let mut attempt = 1;
    loop {
        message.conversation_id = next_id();
        match conn.register(message.conversation_id.clone()) {
            Err(Error::DuplicateId(id)) if attempt < MAX_ID_ATTEMPTS => {
                warn!(conversation_id = %id, attempt, "Correlation id collision, retrying");
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Build the caller's response from the agent's reply.
fn relay_response(rewriter: &HeaderRewriter, reply: IncomingMessage) -> Response {
    let Ok(status) = StatusCode::from_u16(reply.status_code) else {
        return gateway_error(&Error::Upstream(format!(
            "agent sent invalid status code {}",
            reply.status_code
        )));
    };
    if reply.content_length >= 0 && reply.content_length as usize != reply.body.len() {
        debug!(
            conversation_id = %reply.conversation_id,
            declared = reply.content_length,
            actual = reply.body.len(),
            "Content length mismatch, using body size"
        );
    }

    let mut response = Response::new(Body::from(reply.body));
    *response.status_mut() = status;
    *response.headers_mut() = rewriter.rewrite_response(&reply.headers);
    response
}

/// 502 for every failure except a missed deadline, which is 504.
pub fn gateway_error(err: &Error) -> Response {
    let status = match err.kind() {
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    let mut response = (status, err.to_string()).into_response();
    response
        .headers_mut()
        .insert(ERROR_HEADER, HeaderValue::from_static(err.kind().code()));
    response
}

fn classify(err: &Error) -> Outcome {
    match err {
        Error::NotConnected => Outcome::NoAgent,
        Error::Timeout => Outcome::GatewayTimeout,
        Error::UpstreamRefused(_) => Outcome::UpstreamRefused,
        _ => Outcome::GatewayError,
    }
}

fn elapsed_us(started: Instant) -> u64 {
    started.elapsed().as_micros() as u64
}
