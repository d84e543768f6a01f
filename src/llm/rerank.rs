use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::client::{check_status, map_send_error};
use super::types::{RerankHit, RerankRequest};
use super::Reranker;
use crate::config::RequestConfig;
use crate::error::{LlmError, LlmResult};

/// Client for an external cross-encoder reranking server (`POST /rerank`)
pub struct HttpReranker {
    client: Client,
    base_url: String,
    timeout_ms: u64,
}

impl HttpReranker {
    /// Create a new reranker client
    pub fn new(base_url: &str, request_config: &RequestConfig) -> LlmResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(LlmError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_ms: request_config.timeout_ms,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, texts: &[String]) -> LlmResult<Vec<RerankHit>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/rerank", self.base_url);
        debug!(candidates = texts.len(), "Calling reranker");

        let response = self
            .client
            .post(&url)
            .json(&RerankRequest {
                query,
                texts,
                raw_scores: false,
                truncate: true,
            })
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout_ms))?;
        let response = check_status(response).await?;

        let hits: Vec<RerankHit> = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse {
                message: format!("Failed to parse rerank response: {}", e),
            })?;

        if let Some(bad) = hits.iter().find(|h| h.index >= texts.len()) {
            return Err(LlmError::InvalidResponse {
                message: format!("rerank index {} out of range", bad.index),
            });
        }

        Ok(hits)
    }
}
