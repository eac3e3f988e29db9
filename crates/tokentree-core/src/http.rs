//! HTTP+JSON transport for the generation backend
//!
//! Talks to the reference server's `/api/beam-tree` and `/api/expand-depth`
//! routes. Timeouts are the transport's business; the core never enforces one.

use crate::backend::{
    ExpandDepthRequest, ExpandDepthResponse, InitialTreeRequest, InitialTreeResponse,
    TransportError, TreeBackend,
};
use crate::config::HttpConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;

const BEAM_TREE_ROUTE: &str = "api/beam-tree";
const EXPAND_DEPTH_ROUTE: &str = "api/expand-depth";

pub struct HttpBackend {
    client: Client,
    config: HttpConfig,
}

impl HttpBackend {
    pub fn new(config: HttpConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| TransportError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        route: &str,
        body: &B,
    ) -> Result<R, TransportError> {
        let url = self.config.endpoint(route);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl TreeBackend for HttpBackend {
    async fn initial_tree(
        &self,
        request: InitialTreeRequest,
    ) -> Result<InitialTreeResponse, TransportError> {
        self.post(BEAM_TREE_ROUTE, &request).await
    }

    async fn expand_depth(
        &self,
        request: ExpandDepthRequest,
    ) -> Result<ExpandDepthResponse, TransportError> {
        self.post(EXPAND_DEPTH_ROUTE, &request).await
    }
}

/// The server reports failures as `{"error": "..."}`; fall back to the raw body
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}
