//! Wire messages exchanged between the relay and the agent.
//!
//! Every frame is a JSON text frame. Bodies travel as standard base64 and
//! headers as an object mapping each name to its list of values.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, ErrorKind, Result};

/// Maximum frame size accepted on the tunnel (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Largest body that still fits in one frame once base64-encoded, leaving
/// 1 MiB for headers and the JSON envelope.
pub const MAX_BODY_SIZE: usize = MAX_MESSAGE_SIZE / 4 * 3 - 1024 * 1024;

/// Correlation token linking a forwarded request to its response
pub type ConversationId = String;

/// Headers that only make sense for a single hop and are never forwarded.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Request forwarded from the relay to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub conversation_id: ConversationId,
    pub protocol: String,
    pub host: String,
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub content_length: i64,
}

impl OutgoingMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Reply (or agent-reported failure) sent back through the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub content_length: i64,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl IncomingMessage {
    pub fn response(
        conversation_id: impl Into<ConversationId>,
        status_code: u16,
        headers: Headers,
        body: Vec<u8>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            status_code,
            headers,
            content_length: body.len() as i64,
            body,
            error_kind: None,
            error_message: None,
        }
    }

    /// A failure report for `conversation_id`. The status code is only a hint;
    /// the relay maps the error kind itself.
    pub fn failure(conversation_id: impl Into<ConversationId>, err: &Error) -> Self {
        let status_code = match err.kind() {
            ErrorKind::Timeout => 504,
            _ => 502,
        };
        Self {
            conversation_id: conversation_id.into(),
            status_code,
            headers: Headers::default(),
            body: Vec::new(),
            content_length: 0,
            error_kind: Some(err.kind()),
            error_message: Some(err.detail()),
        }
    }

    /// The failure this message reports, if any.
    pub fn error(&self) -> Option<Error> {
        self.error_kind.map(|kind| {
            Error::from_kind(kind, self.error_message.clone().unwrap_or_default())
        })
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Ordered, multi-valued header list.
///
/// Serialized as a JSON object mapping each name to its values in first-seen
/// order; a bare string value is accepted when decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Replace every value of `name` with a single `value`.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.0.push((name.to_string(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut groups: Vec<(&str, Vec<&str>)> = Vec::new();
        for (name, value) in &self.0 {
            match groups.iter_mut().find(|(n, _)| *n == name.as_str()) {
                Some((_, values)) => values.push(value.as_str()),
                None => groups.push((name.as_str(), vec![value.as_str()])),
            }
        }

        let mut map = serializer.serialize_map(Some(groups.len()))?;
        for (name, values) in groups {
            map.serialize_entry(name, &values)?;
        }
        map.end()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

struct HeadersVisitor;

impl<'de> Visitor<'de> for HeadersVisitor {
    type Value = Headers;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of header names to values")
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Headers, E> {
        Ok(Headers::default())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Headers, A::Error> {
        let mut headers = Headers::default();
        while let Some((name, values)) = access.next_entry::<String, HeaderValues>()? {
            match values {
                HeaderValues::One(value) => headers.push(name, value),
                HeaderValues::Many(values) => {
                    for value in values {
                        headers.push(name.clone(), value);
                    }
                }
            }
        }
        Ok(headers)
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(HeadersVisitor)
    }
}

mod base64_body {
    use super::*;

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD.decode(encoded).map_err(de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_group_by_name_in_order() {
        let headers: Headers = vec![
            ("Accept".to_string(), "text/html".to_string()),
            ("Set-Cookie".to_string(), "a=1".to_string()),
            ("Accept".to_string(), "application/json".to_string()),
        ]
        .into_iter()
        .collect();

        let json = serde_json::to_string(&headers).unwrap();
        assert_eq!(
            json,
            r#"{"Accept":["text/html","application/json"],"Set-Cookie":["a=1"]}"#
        );
    }

    #[test]
    fn test_decode_response_frame() {
        let frame = br#"{
            "status_code": 200,
            "headers": {"Content-Type": ["text/plain"], "X-Single": "one"},
            "body": "YmFy",
            "content_length": 3,
            "conversation_id": "6ba7b810-9dad-11d1-80b4-00c04fd430c8",
            "error_kind": null
        }"#;
        let msg = IncomingMessage::decode(frame).unwrap();
        assert_eq!(msg.status_code, 200);
        assert_eq!(msg.body, b"bar");
        assert_eq!(msg.headers.get("content-type"), Some("text/plain"));
        assert_eq!(msg.headers.get("x-single"), Some("one"));
        assert!(msg.error().is_none());
    }

    #[test]
    fn test_null_headers_and_body() {
        let msg = IncomingMessage::decode(br#"{"conversation_id":"x","headers":null,"body":null}"#).unwrap();
        assert!(msg.headers.is_empty());
        assert!(msg.body.is_empty());
    }

    #[test]
    fn test_malformed_frame_is_decode_error() {
        let err = IncomingMessage::decode(b"{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);

        let err = IncomingMessage::decode(br#"{"conversation_id":"x","body":"%%%"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn test_failure_carries_kind_and_text() {
        let err = Error::UpstreamRefused("127.0.0.1:3000".into());
        let msg = IncomingMessage::failure("abc", &err);
        let text = msg.encode().unwrap();
        assert!(text.contains(r#""error_kind":"upstream_refused""#));

        let back = IncomingMessage::decode(text.as_bytes()).unwrap();
        assert!(matches!(back.error(), Some(Error::UpstreamRefused(m)) if m == "127.0.0.1:3000"));
    }

    #[test]
    fn test_largest_body_fits_in_one_frame() {
        let mut headers = Headers::new();
        headers.push("Content-Type", "application/octet-stream");
        let msg = IncomingMessage::response("id", 200, headers, vec![0xff; MAX_BODY_SIZE]);
        assert!(msg.encode().unwrap().len() <= MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_outgoing_body_is_base64() {
        let msg = OutgoingMessage {
            conversation_id: "id".into(),
            protocol: "HTTP/1.1".into(),
            host: "example.com".into(),
            path: "/upload?x=1".into(),
            method: "POST".into(),
            headers: Headers::new(),
            body: vec![0, 159, 255],
            content_length: 3,
        };
        let text = msg.encode().unwrap();
        assert!(text.contains(r#""body":"AJ//""#));
        assert_eq!(OutgoingMessage::decode(text.as_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_hop_by_hop() {
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("connection"));
        assert!(!is_hop_by_hop("Content-Type"));
    }
}
