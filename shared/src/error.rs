//! Error types for Burrow.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Tunnel transport error: {0}")]
    Transport(String),

    #[error("Timed out waiting for the agent")]
    Timeout,

    #[error("Upstream refused connection: {0}")]
    UpstreamRefused(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Malformed frame: {0}")]
    Decode(String),

    #[error("Conversation {0} is already pending")]
    DuplicateId(String),

    #[error("No agent connected")]
    NotConnected,

    #[error("An agent is already connected")]
    AlreadyConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl Error {
    /// Stable code for this error, as carried on the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) | Error::NotConnected | Error::AlreadyConnected | Error::Io(_) => {
                ErrorKind::Transport
            }
            Error::Timeout => ErrorKind::Timeout,
            Error::UpstreamRefused(_) => ErrorKind::UpstreamRefused,
            Error::Upstream(_) => ErrorKind::Upstream,
            Error::Decode(_) => ErrorKind::Decode,
            Error::DuplicateId(_) => ErrorKind::DuplicateId,
        }
    }

    /// The message without its variant prefix; [`Error::from_kind`] restores
    /// the prefix on the other side of the tunnel.
    pub fn detail(&self) -> String {
        match self {
            Error::Transport(m)
            | Error::UpstreamRefused(m)
            | Error::Upstream(m)
            | Error::Decode(m)
            | Error::DuplicateId(m) => m.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error from a wire code and its human text.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Transport => Error::Transport(message),
            ErrorKind::Timeout => Error::Timeout,
            ErrorKind::UpstreamRefused => Error::UpstreamRefused(message),
            ErrorKind::Upstream => Error::Upstream(message),
            ErrorKind::Decode => Error::Decode(message),
            ErrorKind::DuplicateId => Error::DuplicateId(message),
        }
    }
}

/// Error classes that cross the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Tunnel send/receive failure
    Transport,
    /// No response before the deadline
    Timeout,
    /// The agent's own upstream refused the connection
    UpstreamRefused,
    /// Any other failure the agent hit while serving the request
    Upstream,
    /// Malformed frame payload
    Decode,
    /// Correlation token collision
    DuplicateId,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::UpstreamRefused => "upstream_refused",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Decode => "decode",
            ErrorKind::DuplicateId => "duplicate_id",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_match_serde() {
        for kind in [
            ErrorKind::Transport,
            ErrorKind::Timeout,
            ErrorKind::UpstreamRefused,
            ErrorKind::Upstream,
            ErrorKind::Decode,
            ErrorKind::DuplicateId,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.code()));
        }
    }

    #[test]
    fn test_connection_errors_are_transport() {
        assert_eq!(Error::NotConnected.kind(), ErrorKind::Transport);
        assert_eq!(Error::AlreadyConnected.kind(), ErrorKind::Transport);
        assert!(matches!(
            Error::from_kind(ErrorKind::UpstreamRefused, "127.0.0.1:3000"),
            Error::UpstreamRefused(addr) if addr == "127.0.0.1:3000"
        ));
    }

    #[test]
    fn test_detail_survives_round_trip() {
        let err = Error::Upstream("connection reset".into());
        let back = Error::from_kind(err.kind(), err.detail());
        assert_eq!(back.to_string(), err.to_string());
        assert_eq!(Error::Timeout.detail(), Error::Timeout.to_string());
    }
}
