//! Online transport for `--online` conversions.

use std::time::Duration;

use anyhow::Context;
use scenebox_sandbox::transport::{decode_data_url, TransportError};
use scenebox_sandbox::{NetworkRequest, NetworkResponse, NetworkTransport};

/// Upper bound on a single response body.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Performs admitted requests over HTTP(S).
///
/// Redirects are not followed: the guest's allow-list approved the original
/// URL, not wherever the server points next.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .user_agent(concat!("scenebox/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl NetworkTransport for HttpTransport {
    async fn fetch(&self, request: NetworkRequest) -> Result<NetworkResponse, TransportError> {
        if request.url.starts_with("data:") {
            return decode_data_url(&request.url);
        }
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError::Failed(format!("invalid method {}: {e}", request.method)))?;
        let mut builder = self.client.request(method, &request.url);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Failed(format!("Failed to fetch {}: {e}", request.url)))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if response
            .content_length()
            .is_some_and(|len| len as usize > MAX_BODY_BYTES)
        {
            return Err(TransportError::Failed(format!(
                "Failed to fetch {}: response larger than {MAX_BODY_BYTES} bytes",
                request.url
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Failed(format!("Failed to fetch {}: {e}", request.url)))?;
        if body.len() > MAX_BODY_BYTES {
            return Err(TransportError::Failed(format!(
                "Failed to fetch {}: response larger than {MAX_BODY_BYTES} bytes",
                request.url
            )));
        }

        tracing::debug!(url = %request.url, status, bytes = body.len(), "fetched");
        Ok(NetworkResponse {
            status,
            content_type,
            body: body.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenebox_sandbox::protocol::NetworkChannel;

    #[tokio::test]
    async fn data_urls_never_touch_the_network() {
        let transport = HttpTransport::new(Duration::from_secs(1)).unwrap();
        let response = transport
            .fetch(NetworkRequest::get(
                "data:text/plain;base64,aGk=",
                NetworkChannel::Fetch,
            ))
            .await
            .unwrap();
        assert_eq!(response.body, b"hi");
    }

    #[tokio::test]
    async fn unreachable_hosts_fail_as_load_errors() {
        let transport = HttpTransport::new(Duration::from_millis(500)).unwrap();
        let err = transport
            .fetch(NetworkRequest::get("http://127.0.0.1:9/x.png", NetworkChannel::Asset))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Failed to fetch"), "{err}");
    }
}
