//! Network capability handed to the guest runtime.
//!
//! The isolate has no ambient network. Every request the network guard admits
//! is performed by a [`NetworkTransport`] supplied by the host.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::protocol::NetworkChannel;

/// A request the network guard has already admitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRequest {
    /// Absolute URL.
    pub url: String,
    /// Primitive that initiated the request.
    pub channel: NetworkChannel,
    /// HTTP method (`GET` for scripts and assets).
    pub method: String,
    /// Optional textual body.
    #[serde(default)]
    pub body: Option<String>,
}

impl NetworkRequest {
    /// A `GET` request on the given channel.
    pub fn get(url: impl Into<String>, channel: NetworkChannel) -> Self {
        Self {
            url: url.into(),
            channel,
            method: "GET".into(),
            body: None,
        }
    }
}

/// Response handed back to guest code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkResponse {
    pub status: u16,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(with = "crate::protocol::base64_bytes")]
    pub body: Vec<u8>,
}

/// Failure performing an admitted request.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// The transport does not perform network I/O for this URL.
    #[error("network unavailable for {0}")]
    Offline(String),

    /// A `data:` URL could not be decoded.
    #[error("malformed data URL: {0}")]
    MalformedDataUrl(String),

    /// Any other transport failure.
    #[error("{0}")]
    Failed(String),
}

/// Performs network requests on behalf of the guest.
///
/// Implementations only ever see requests that passed the guest's allow-list
/// and quota.
#[async_trait::async_trait]
pub trait NetworkTransport: Send + Sync {
    /// Perform a request and return the full response.
    async fn fetch(&self, request: NetworkRequest) -> Result<NetworkResponse, TransportError>;
}

/// Default transport: resolves `data:` URLs in memory and refuses the rest.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineTransport;

#[async_trait::async_trait]
impl NetworkTransport for OfflineTransport {
    async fn fetch(&self, request: NetworkRequest) -> Result<NetworkResponse, TransportError> {
        if request.url.starts_with("data:") {
            return decode_data_url(&request.url);
        }
        Err(TransportError::Offline(request.url))
    }
}

/// Decode a `data:[<mediatype>][;base64],<payload>` URL.
pub fn decode_data_url(url: &str) -> Result<NetworkResponse, TransportError> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| TransportError::MalformedDataUrl(truncate(url)))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| TransportError::MalformedDataUrl(truncate(url)))?;

    let (media_type, is_base64) = match header.strip_suffix(";base64") {
        Some(media) => (media, true),
        None => (header, false),
    };

    let body = if is_base64 {
        let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| TransportError::MalformedDataUrl(e.to_string()))?
    } else {
        percent_decode(payload)
    };

    let content_type = if media_type.is_empty() {
        "text/plain;charset=US-ASCII".to_string()
    } else {
        media_type.to_string()
    };

    Ok(NetworkResponse {
        status: 200,
        content_type: Some(content_type),
        body,
    })
}

fn percent_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn truncate(url: &str) -> String {
    url.chars().take(64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_base64_payload() {
        let resp = decode_data_url("data:application/json;base64,eyJhIjoxfQ==").unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.content_type.as_deref(), Some("application/json"));
        assert_eq!(resp.body, br#"{"a":1}"#);
    }

    #[test]
    fn decodes_percent_encoded_payload() {
        let resp = decode_data_url("data:,hello%20world%21").unwrap();
        assert_eq!(resp.body, b"hello world!");
        assert_eq!(
            resp.content_type.as_deref(),
            Some("text/plain;charset=US-ASCII")
        );
    }

    #[test]
    fn keeps_truncated_escape_literal() {
        let resp = decode_data_url("data:,100%").unwrap();
        assert_eq!(resp.body, b"100%");
    }

    #[test]
    fn rejects_missing_comma() {
        assert!(matches!(
            decode_data_url("data:text/plain"),
            Err(TransportError::MalformedDataUrl(_))
        ));
    }

    #[tokio::test]
    async fn offline_transport_refuses_remote_urls() {
        let err = OfflineTransport
            .fetch(NetworkRequest::get(
                "https://cdn.example.com/a.js",
                NetworkChannel::Script,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Offline(_)));
    }

    #[tokio::test]
    async fn offline_transport_serves_data_urls() {
        let resp = OfflineTransport
            .fetch(NetworkRequest::get("data:,ok", NetworkChannel::Fetch))
            .await
            .unwrap();
        assert_eq!(resp.body, b"ok");
    }
}
