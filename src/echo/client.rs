//! Requests to the echo server through a client proxy

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::common::{truncate_to_bytes, Error, Result};

use super::server::echo_url;

/// Status and body of one echo request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoResponse {
    pub status: u16,
    pub body: String,
}

impl EchoResponse {
    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Something that can ask the echo server to echo a payload
#[async_trait]
pub trait EchoRequester: Send + Sync {
    async fn request_echo(&self, content: &str) -> Result<EchoResponse>;
}

/// Sends the request through a client's HTTP proxy endpoint
#[derive(Debug, Clone)]
pub struct ProxiedRequester {
    client: reqwest::Client,
    origin: SocketAddr,
    preview_bytes: usize,
}

impl ProxiedRequester {
    /// `proxy` is the client's listening endpoint, `origin` the echo server
    pub fn new(
        proxy: SocketAddr,
        origin: SocketAddr,
        timeout: Duration,
        preview_bytes: usize,
    ) -> Result<Self> {
        let proxy = reqwest::Proxy::http(format!("http://{}", proxy))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(timeout)
            // Every attempt opens a fresh connection through the chain
            .pool_max_idle_per_host(0)
            .build()?;

        Ok(Self {
            client,
            origin,
            preview_bytes,
        })
    }
}

#[async_trait]
impl EchoRequester for ProxiedRequester {
    async fn request_echo(&self, content: &str) -> Result<EchoResponse> {
        let url = echo_url(self.origin, content)?;
        tracing::debug!("GET {}", url);

        let response = self.client.get(url).send().await.map_err(Error::from)?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        tracing::info!(
            "Response {} ({} bytes): {}",
            status,
            body.len(),
            truncate_to_bytes(&body, self.preview_bytes)
        );

        Ok(EchoResponse { status, body })
    }
}
