//! Inbound half of a tunnel connection.
//!
//! One reader runs per connection. It owns the read deadline, answers
//! keepalive pings and routes replies to the connection's correlator. It
//! never tears the connection down itself; the session does that with the
//! returned [`ReadExit`].

use std::fmt;
use std::time::Duration;

use axum::extract::ws::Message;
use burrow_shared::protocol::IncomingMessage;
use futures_util::{Stream, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::tunnel::TunnelConnection;

/// Why the reader stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadExit {
    /// Agent sent a close frame
    Closed,
    /// Stream ended without a close frame
    Eof,
    /// Nothing arrived within the idle window
    IdleTimeout(Duration),
    /// Socket error, or the pong could not be queued
    Transport(String),
    /// Connection torn down from elsewhere (replaced, writer failed, shutdown)
    Shutdown,
}

impl fmt::Display for ReadExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadExit::Closed => f.write_str("agent closed the tunnel"),
            ReadExit::Eof => f.write_str("tunnel stream ended"),
            ReadExit::IdleTimeout(idle) => write!(f, "no frame from agent for {}s", idle.as_secs()),
            ReadExit::Transport(e) => write!(f, "tunnel read failed: {e}"),
            ReadExit::Shutdown => f.write_str("tunnel shut down"),
        }
    }
}

/// Sliding read deadline: every received frame pushes it one idle window out.
#[derive(Debug, Clone, Copy)]
pub struct ReadDeadline {
    idle: Duration,
    at: Instant,
}

/// Stand-in for "never" when the idle window does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

impl ReadDeadline {
    pub fn new(idle: Duration) -> Self {
        let now = Instant::now();
        Self {
            idle,
            at: after(now, idle),
        }
    }

    pub fn extend(&mut self, now: Instant) -> Instant {
        self.at = after(now, self.idle);
        self.at
    }

    pub fn at(&self) -> Instant {
        self.at
    }
}

fn after(now: Instant, idle: Duration) -> Instant {
    now.checked_add(idle).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Read frames until the connection ends, returning the reason.
pub async fn read_loop<S, E>(stream: &mut S, conn: &TunnelConnection, idle: Duration) -> ReadExit
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let mut closed = conn.closed_signal();
    let mut deadline = ReadDeadline::new(idle);

    loop {
        let next = tokio::select! {
            biased;
            _ = closed.wait_for(|done| *done) => return ReadExit::Shutdown,
            next = tokio::time::timeout_at(deadline.at(), stream.next()) => next,
        };

        let frame = match next {
            Err(_) => return ReadExit::IdleTimeout(idle),
            Ok(None) => return ReadExit::Eof,
            Ok(Some(Err(e))) => return ReadExit::Transport(e.to_string()),
            Ok(Some(Ok(frame))) => frame,
        };
        deadline.extend(Instant::now());

        match frame {
            Message::Text(text) => route(conn, text.as_bytes()),
            Message::Binary(data) => route(conn, &data),
            Message::Ping(payload) => {
                debug!(conn_id = conn.id(), "Keepalive ping, answering");
                if let Err(e) = conn.send_control(Message::Pong(payload)).await {
                    return ReadExit::Transport(e.to_string());
                }
            }
            Message::Pong(_) => debug!(conn_id = conn.id(), "Pong from agent"),
            Message::Close(frame) => {
                info!(conn_id = conn.id(), ?frame, "Agent sent close frame");
                return ReadExit::Closed;
            }
        }
    }
}

fn route(conn: &TunnelConnection, data: &[u8]) {
    match IncomingMessage::decode(data) {
        Ok(msg) => {
            debug!(
                conn_id = conn.id(),
                conversation_id = %msg.conversation_id,
                status = msg.status_code,
                "Response from agent"
            );
            conn.correlator().dispatch(msg);
        }
        Err(e) => warn!(conn_id = conn.id(), "Dropping malformed frame: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_shared::protocol::Headers;
    use burrow_shared::ErrorKind;
    use futures_util::stream;
    use std::convert::Infallible;

    fn reply_frame(id: &str, body: &str) -> Message {
        let msg = IncomingMessage::response(id, 200, Headers::new(), body.as_bytes().to_vec());
        Message::Text(msg.encode().unwrap())
    }

    #[test]
    fn test_extend_moves_deadline_by_idle_window() {
        let idle = Duration::from_secs(120);
        let mut deadline = ReadDeadline::new(idle);
        let now = Instant::now() + Duration::from_secs(45);
        assert_eq!(deadline.extend(now) - now, idle);
        assert_eq!(deadline.at(), now + idle);
    }

    #[test]
    fn test_oversized_idle_window_saturates() {
        let now = Instant::now();
        let mut deadline = ReadDeadline::new(Duration::MAX);
        assert!(deadline.at() > now);
        assert!(deadline.extend(now) >= now + FAR_FUTURE);
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_stop_reader() {
        let (conn, _rx) = TunnelConnection::new(1);
        let waiter = conn.register("abc".into()).unwrap();

        let mut frames = stream::iter(vec![
            Ok::<_, Infallible>(Message::Text("{definitely not json".into())),
            Ok(Message::Binary(b"\x00\x01".to_vec())),
            Ok(reply_frame("unknown", "stray")),
            Ok(reply_frame("abc", "bar")),
            Ok(Message::Close(None)),
        ]);

        let exit = read_loop(&mut frames, &conn, Duration::from_secs(5)).await;
        assert_eq!(exit, ReadExit::Closed);
        assert_eq!(waiter.wait().await.unwrap().body, b"bar");
    }

    #[tokio::test]
    async fn test_end_of_stream_and_errors() {
        let (conn, _rx) = TunnelConnection::new(1);

        let mut empty = stream::iter(Vec::<Result<Message, Infallible>>::new());
        assert_eq!(read_loop(&mut empty, &conn, Duration::from_secs(5)).await, ReadExit::Eof);

        let mut failing = stream::iter(vec![Err::<Message, _>("connection reset")]);
        assert_eq!(
            read_loop(&mut failing, &conn, Duration::from_secs(5)).await,
            ReadExit::Transport("connection reset".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_is_answered_and_extends_deadline() {
        let idle = Duration::from_secs(10);
        let (conn, mut rx) = TunnelConnection::new(1);

        // One ping 8s in, then silence
        let mut frames = Box::pin(stream::unfold(false, |sent| async move {
            if sent {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(Duration::from_secs(8)).await;
            Some((Ok::<_, Infallible>(Message::Ping(b"hb".to_vec())), true))
        }));

        let start = Instant::now();
        let exit = read_loop(&mut frames, &conn, idle).await;
        let elapsed = start.elapsed();

        assert_eq!(exit, ReadExit::IdleTimeout(idle));
        assert!(elapsed >= Duration::from_secs(18), "deadline not extended: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(18) + Duration::from_millis(50));

        let pong = rx.recv().await.unwrap();
        assert!(matches!(pong.frame, Message::Pong(ref p) if p == b"hb"));
        assert!(pong.ack.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_times_out_after_idle_window() {
        let idle = Duration::from_secs(120);
        let (conn, _rx) = TunnelConnection::new(1);
        let mut silent = stream::pending::<Result<Message, Infallible>>();

        let start = Instant::now();
        assert_eq!(read_loop(&mut silent, &conn, idle).await, ReadExit::IdleTimeout(idle));
        assert!(start.elapsed() >= idle);
    }

    #[tokio::test]
    async fn test_teardown_stops_reader() {
        let (conn, _rx) = TunnelConnection::new(1);
        let mut silent = stream::pending::<Result<Message, Infallible>>();

        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move { read_loop(&mut silent, &conn, Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;
        conn.teardown(ErrorKind::Transport, "replaced by a new agent connection");

        assert_eq!(reader.await.unwrap(), ReadExit::Shutdown);
    }
}
