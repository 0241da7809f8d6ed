//! Thin HTTP client for the upstream OpenAI-compatible API.
//!
//! The proxy is a credential forwarder, not a store: the bearer token comes
//! from the downstream caller on every request.

use crate::error::{ProxyError, Result};
use crate::router::ApiFlavor;
use serde::Serialize;
use std::time::Duration;

const USER_AGENT: &str = concat!("model-router-proxy/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    /// Only the connect phase is bounded; no read timeout is set so long
    /// streams are never cut mid-flight.
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Endpoint for an API flavor, tolerating bases with or without a
    /// trailing `/v1`.
    pub fn endpoint_url(&self, flavor: ApiFlavor) -> String {
        let endpoint = match flavor {
            ApiFlavor::Chat => "chat/completions",
            ApiFlavor::Responses => "responses",
        };
        if self.base_url.ends_with("/v1") {
            format!("{}/{}", self.base_url, endpoint)
        } else {
            format!("{}/v1/{}", self.base_url, endpoint)
        }
    }

    /// POST a JSON body with the caller's bearer token. Returns the raw
    /// response; status handling and body/stream consumption are the
    /// caller's concern.
    pub async fn post<B: Serialize>(
        &self,
        flavor: ApiFlavor,
        api_key: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        self.client
            .post(self.endpoint_url(flavor))
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| ProxyError::upstream(format!("Upstream request failed: {e}")))
    }
}
