//! Agent side of the tunnel: dial the relay, serve forwarded requests
//! concurrently, and reconnect when the tunnel dies.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use burrow_shared::protocol::{IncomingMessage, OutgoingMessage, MAX_MESSAGE_SIZE};
use burrow_shared::Error;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::proxy::LocalForwarder;
use crate::reconnect::Backoff;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Replies queued for the writer before request tasks start waiting
const OUTBOUND_QUEUE: usize = 256;

/// How long a finished session waits for in-flight replies to drain
const WRITER_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// Keep a tunnel to the relay open until `shutdown` flips to true.
pub async fn run(config: AgentConfig, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let forwarder = Arc::new(LocalForwarder::new(
        &config.target,
        config.request_timeout(),
        config.max_body_bytes,
    )?);
    let mut backoff = Backoff::from_config(&config.reconnect);

    loop {
        let connected = tokio::select! {
            res = connect_async(config.server.as_str()) => res,
            _ = stopped(&mut shutdown) => return Ok(()),
        };

        match connected {
            Ok((ws, _)) => {
                info!(server = %config.server, target = %forwarder.target(), "Tunnel established");
                backoff.reset();
                match session(ws, &config, &forwarder, &mut shutdown).await {
                    SessionEnd::Shutdown => return Ok(()),
                    SessionEnd::Lost(reason) => warn!("Tunnel lost: {}", reason),
                }
            }
            Err(e) => warn!(server = %config.server, "Failed to connect to relay: {}", e),
        }

        // In-flight requests are not replayed on the next connection
        let delay = backoff.next_delay();
        info!("Reconnecting in {}s (attempt {})", delay.as_secs(), backoff.attempt());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stopped(&mut shutdown) => return Ok(()),
        }
    }
}

async fn session(
    ws: WsStream,
    config: &AgentConfig,
    forwarder: &Arc<LocalForwarder>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (sink, mut stream) = ws.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let mut writer = tokio::spawn(write_loop(sink, rx));

    let idle = config.idle_timeout();
    let mut deadline = Instant::now() + idle;
    let mut ping = tokio::time::interval_at(Instant::now() + config.ping_interval(), config.ping_interval());
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let end = loop {
        tokio::select! {
            _ = stopped(shutdown) => break SessionEnd::Shutdown,
            _ = ping.tick() => {
                if tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break SessionEnd::Lost("tunnel writer stopped".into());
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                break SessionEnd::Lost(format!("no frame from relay for {}s", idle.as_secs()));
            }
            frame = stream.next() => {
                let frame = match frame {
                    None => break SessionEnd::Lost("relay closed the connection".into()),
                    Some(Err(e)) => break SessionEnd::Lost(e.to_string()),
                    Some(Ok(frame)) => frame,
                };
                deadline = Instant::now() + idle;

                match frame {
                    Message::Text(text) => handle_request(text.as_bytes(), forwarder, &tx),
                    Message::Binary(data) => handle_request(&data, forwarder, &tx),
                    Message::Ping(payload) => {
                        if tx.send(Message::Pong(payload)).await.is_err() {
                            break SessionEnd::Lost("tunnel writer stopped".into());
                        }
                    }
                    Message::Pong(_) => debug!("Pong from relay"),
                    Message::Close(frame) => {
                        let reason = frame.map(|f| f.reason.into_owned()).unwrap_or_default();
                        break SessionEnd::Lost(format!("relay closed the tunnel ({})", reason));
                    }
                    Message::Frame(_) => {}
                }
            }
        }
    };

    if matches!(end, SessionEnd::Shutdown) {
        info!("Closing tunnel");
        let _ = tx.send(Message::Close(None)).await;
    }
    drop(tx);
    if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        warn!("Tunnel writer did not stop in time, aborting");
        writer.abort();
    }
    end
}

/// Resolves once shutdown is requested or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Sole owner of the socket's write half.
async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(frame) = rx.recv().await {
        let closing = matches!(frame, Message::Close(_));
        if let Err(e) = sink.send(frame).await {
            warn!("Tunnel write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

fn handle_request(data: &[u8], forwarder: &Arc<LocalForwarder>, tx: &mpsc::Sender<Message>) {
    let request = match OutgoingMessage::decode(data) {
        Ok(request) => request,
        Err(e) => {
            warn!("Dropping malformed frame: {}", e);
            return;
        }
    };
    let conversation_id = request.conversation_id.clone();
    info!(
        conversation_id = %conversation_id,
        method = %request.method,
        path = %request.path,
        "Proxying to local service"
    );

    let forwarder = Arc::clone(forwarder);
    let tx = tx.clone();
    tokio::spawn(async move {
        let started = Instant::now();
        let reply = forwarder.forward(request).await;
        debug!(
            conversation_id = %conversation_id,
            status = reply.status_code,
            latency_ms = started.elapsed().as_millis() as u64,
            "Local service replied"
        );

        if let Some(text) = encode_reply(reply) {
            if tx.send(Message::Text(text)).await.is_err() {
                warn!(conversation_id = %conversation_id, "Tunnel closed before the reply was sent");
            }
        }
    });
}

/// Encode a reply, swapping in an error reply when the frame would exceed
/// what the relay accepts. An oversized frame would cost the whole tunnel.
fn encode_reply(reply: IncomingMessage) -> Option<String> {
    let id = reply.conversation_id.clone();
    let text = match reply.encode() {
        Ok(text) => text,
        Err(e) => {
            warn!(conversation_id = %id, "Failed to encode reply: {}", e);
            return None;
        }
    };
    if text.len() <= MAX_MESSAGE_SIZE {
        return Some(text);
    }

    warn!(conversation_id = %id, frame_bytes = text.len(), "Reply exceeds the tunnel frame limit");
    let err = Error::Upstream(format!(
        "response too large: {} byte frame exceeds the {} byte tunnel limit",
        text.len(),
        MAX_MESSAGE_SIZE
    ));
    match IncomingMessage::failure(id.clone(), &err).encode() {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(conversation_id = %id, "Failed to encode reply: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_shared::protocol::Headers;
    use burrow_shared::ErrorKind;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    async fn fake_relay() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("http://{}", listener.local_addr().unwrap())
    }

    fn config(server: String, target: String) -> AgentConfig {
        AgentConfig {
            server,
            target,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_serves_requests_and_answers_pings() {
        let (listener, server) = fake_relay().await;
        let (stop, shutdown) = watch::channel(false);
        let agent = tokio::spawn(run(config(server, closed_port().await), shutdown));
        let mut relay = accept(&listener).await;

        let request = OutgoingMessage {
            conversation_id: "r1".into(),
            protocol: "HTTP/1.1".into(),
            host: "public.example.com".into(),
            path: "/".into(),
            method: "GET".into(),
            headers: Headers::new(),
            body: Vec::new(),
            content_length: 0,
        };
        relay.send(Message::Text(request.encode().unwrap())).await.unwrap();
        relay.send(Message::Ping(b"hb".to_vec())).await.unwrap();

        let mut reply = None;
        let mut ponged = false;
        while reply.is_none() || !ponged {
            match timeout(Duration::from_secs(5), relay.next()).await.unwrap().unwrap().unwrap() {
                Message::Text(text) => reply = Some(IncomingMessage::decode(text.as_bytes()).unwrap()),
                Message::Pong(payload) => {
                    assert_eq!(payload, b"hb");
                    ponged = true;
                }
                _ => {}
            }
        }
        let reply = reply.unwrap();
        assert_eq!(reply.conversation_id, "r1");
        assert_eq!(reply.error_kind, Some(ErrorKind::UpstreamRefused));

        stop.send(true).unwrap();
        loop {
            match timeout(Duration::from_secs(5), relay.next()).await.unwrap() {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            }
        }
        timeout(Duration::from_secs(5), agent).await.unwrap().unwrap().unwrap();
    }

    #[test]
    fn test_oversized_reply_becomes_an_error_reply() {
        let small = IncomingMessage::response("ok", 200, Headers::new(), b"fine".to_vec());
        let text = encode_reply(small).unwrap();
        assert_eq!(IncomingMessage::decode(text.as_bytes()).unwrap().body, b"fine");

        // base64 inflates by a third, so this body cannot fit in one frame
        let huge = IncomingMessage::response("big", 200, Headers::new(), vec![0u8; MAX_MESSAGE_SIZE]);
        let text = encode_reply(huge).unwrap();
        assert!(text.len() <= MAX_MESSAGE_SIZE);
        let reply = IncomingMessage::decode(text.as_bytes()).unwrap();
        assert_eq!(reply.conversation_id, "big");
        assert_eq!(reply.status_code, 502);
        assert_eq!(reply.error_kind, Some(ErrorKind::Upstream));
        assert!(reply.body.is_empty());
    }

    #[tokio::test]
    async fn test_reconnects_after_relay_drops() {
        let (listener, server) = fake_relay().await;
        let (stop, shutdown) = watch::channel(false);
        let agent = tokio::spawn(run(config(server, closed_port().await), shutdown));

        drop(accept(&listener).await);
        let _second = timeout(Duration::from_secs(5), accept(&listener))
            .await
            .expect("agent did not reconnect");

        stop.send(true).unwrap();
        timeout(Duration::from_secs(10), agent).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_silent_relay_is_abandoned() {
        let (listener, server) = fake_relay().await;
        let mut cfg = config(server, closed_port().await);
        cfg.ping_interval_secs = 1;
        cfg.idle_timeout_secs = 2;
        let (stop, shutdown) = watch::channel(false);
        let agent = tokio::spawn(run(cfg, shutdown));

        // Accepted but never read, so the agent's pings go unanswered
        let _silent = accept(&listener).await;
        let _second = timeout(Duration::from_secs(8), accept(&listener))
            .await
            .expect("agent kept a dead tunnel");

        stop.send(true).unwrap();
        timeout(Duration::from_secs(10), agent).await.unwrap().unwrap().unwrap();
    }
}
