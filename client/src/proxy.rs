//! Local proxy for forwarding tunnelled requests

use std::time::Duration;

use anyhow::Context;
use burrow_shared::protocol::{is_hop_by_hop, Headers, IncomingMessage, OutgoingMessage};
use burrow_shared::{Error, Result};
use reqwest::{redirect, Client, Method};
use tracing::debug;

/// Replays requests from the relay against the local service.
pub struct LocalForwarder {
    client: Client,
    target: String,
    max_body: usize,
}

impl LocalForwarder {
    /// `max_body` caps the response body relayed back; larger replies are
    /// reported as an upstream failure for that request alone.
    pub fn new(target: &str, timeout: Duration, max_body: usize) -> anyhow::Result<Self> {
        // Redirects go back to the original caller untouched
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(timeout)
            .no_proxy()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            target: target.trim_end_matches('/').to_string(),
            max_body,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Forward one request; failures come back as an error reply.
    pub async fn forward(&self, request: OutgoingMessage) -> IncomingMessage {
        let id = request.conversation_id.clone();
        match self.send(request).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!(conversation_id = %id, kind = %err.kind(), "Local request failed: {}", err);
                IncomingMessage::failure(id, &err)
            }
        }
    }

    async fn send(&self, request: OutgoingMessage) -> Result<IncomingMessage> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| Error::Decode(format!("invalid method {:?}", request.method)))?;
        let url = format!("{}{}", self.target, request.path);

        let mut builder = self.client.request(method, &url);
        for (name, value) in request.headers.iter() {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            builder = builder.header(name, value);
        }
        if !request.host.is_empty() && request.headers.get("x-forwarded-host").is_none() {
            builder = builder.header("x-forwarded-host", request.host.as_str());
        }

        let response = builder.body(request.body).send().await.map_err(classify)?;
        if let Some(len) = response.content_length() {
            self.check_body_size(len as usize)?;
        }
        let status = response.status().as_u16();
        let headers: Headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await.map_err(classify)?.to_vec();
        self.check_body_size(body.len())?;

        Ok(IncomingMessage::response(request.conversation_id, status, headers, body))
    }

    fn check_body_size(&self, len: usize) -> Result<()> {
        if len > self.max_body {
            return Err(Error::Upstream(format!(
                "response too large: {} bytes exceeds the {} byte tunnel limit",
                len, self.max_body
            )));
        }
        Ok(())
    }
}

fn classify(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout
    } else if err.is_connect() {
        Error::UpstreamRefused(err.to_string())
    } else {
        Error::Upstream(err.to_string())
    }
}
