//! Request/Response Header Rewriting
//!
//! Headers cross the tunnel verbatim apart from hop-by-hop headers, which
//! belong to a single connection. Standard proxy headers are optional.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use burrow_shared::protocol::{is_hop_by_hop, Headers};
use tracing::debug;

/// Header rewriter configuration
#[derive(Debug, Clone, Default)]
pub struct HeaderRewriter {
    /// Inject X-Forwarded-For / -Host / -Proto into forwarded requests
    pub inject_proxy_headers: bool,
}

impl HeaderRewriter {
    pub fn new(inject_proxy_headers: bool) -> Self {
        Self { inject_proxy_headers }
    }

    /// Collect inbound request headers for the tunnel message.
    ///
    /// Values that are not valid UTF-8 are passed through lossily.
    pub fn rewrite_request(&self, headers: &HeaderMap, client_ip: Option<&str>, host: &str) -> Headers {
        let mut out: Headers = headers
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        if self.inject_proxy_headers {
            if let Some(ip) = client_ip {
                let forwarded_for = match out.get("x-forwarded-for") {
                    Some(prior) => format!("{prior}, {ip}"),
                    None => ip.to_string(),
                };
                out.set("x-forwarded-for", forwarded_for);
            }
            if out.get("x-forwarded-host").is_none() {
                out.push("x-forwarded-host", host);
            }
            if out.get("x-forwarded-proto").is_none() {
                out.push("x-forwarded-proto", "http");
            }
        }

        out
    }

    /// Convert the agent's headers back into a response header map.
    ///
    /// Content-Length is dropped; the server derives it from the relayed body.
    pub fn rewrite_response(&self, headers: &Headers) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers.iter() {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => debug!(header = name, "Skipping invalid header from agent"),
            }
        }
        map
    }
}
