use async_trait::async_trait;
use reqwest::Client;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

use super::client::{check_status, map_send_error};
use super::types::{NativeEmbedRequest, OpenAiEmbeddingRequest, OpenAiEmbeddingResponse};
use super::Embedder;
use crate::config::{EmbeddingConfig, RequestConfig};
use crate::error::{LlmError, LlmResult};

const HOSTED_OPENAI_HOST: &str = "api.openai.com";

/// Embedding client that speaks the OpenAI `/v1/embeddings` shape and falls
/// back to the native `/embed` shape used by self-hosted embedding servers.
pub struct HttpEmbedder {
    client: Client,
    base_url: String,
    model: Option<String>,
    api_key: Option<String>,
    timeout_ms: u64,
    dimensions: OnceLock<usize>,
}

impl HttpEmbedder {
    /// Create a new embedding client
    pub fn new(config: &EmbeddingConfig, request_config: &RequestConfig) -> LlmResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(LlmError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            timeout_ms: request_config.timeout_ms,
            dimensions: OnceLock::new(),
        })
    }

    async fn embed_openai(&self, texts: &[String]) -> LlmResult<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let mut builder = self.client.post(&url).json(&OpenAiEmbeddingRequest {
            input: texts,
            model: self.model.as_deref(),
        });
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout_ms))?;
        let response = check_status(response).await?;

        let parsed: OpenAiEmbeddingResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse {
                    message: format!("Failed to parse embeddings response: {}", e),
                })?;

        reorder_by_index(parsed, texts.len())
    }

    async fn embed_native(&self, texts: &[String]) -> LlmResult<Vec<Vec<f32>>> {
        let url = format!("{}/embed", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&NativeEmbedRequest {
                inputs: texts,
                truncate: true,
            })
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout_ms))?;
        let response = check_status(response).await?;

        response
            .json::<Vec<Vec<f32>>>()
            .await
            .map_err(|e| LlmError::InvalidResponse {
                message: format!("Failed to parse native embed response: {}", e),
            })
    }

    fn validate(&self, texts: &[String], vectors: Vec<Vec<f32>>) -> LlmResult<Vec<Vec<f32>>> {
        if vectors.len() != texts.len() {
            return Err(LlmError::InvalidResponse {
                message: format!(
                    "embedder returned {} vectors for {} inputs",
                    vectors.len(),
                    texts.len()
                ),
            });
        }

        let dim = vectors.first().map(Vec::len).unwrap_or(0);
        if dim == 0 || vectors.iter().any(|v| v.len() != dim) {
            return Err(LlmError::InvalidResponse {
                message: "embedder returned empty or ragged vectors".to_string(),
            });
        }

        let cached = *self.dimensions.get_or_init(|| dim);
        if cached != dim {
            warn!(
                cached,
                returned = dim,
                "Embedder changed dimension since first call"
            );
        }

        Ok(vectors)
    }
}

/// Order OpenAI-shaped results by their `index` field, falling back to
/// arrival order when the server omits it.
fn reorder_by_index(response: OpenAiEmbeddingResponse, expected: usize) -> LlmResult<Vec<Vec<f32>>> {
    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
    for (position, item) in response.data.into_iter().enumerate() {
        let index = item.index.unwrap_or(position);
        let slot = slots.get_mut(index).ok_or_else(|| LlmError::InvalidResponse {
            message: format!("embedding index {} out of range ({} inputs)", index, expected),
        })?;
        *slot = Some(item.embedding);
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(i, v)| {
            v.ok_or_else(|| LlmError::InvalidResponse {
                message: format!("missing embedding for input {}", i),
            })
        })
        .collect()
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> LlmResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if self.api_key.is_none() && self.base_url.contains(HOSTED_OPENAI_HOST) {
            return Err(LlmError::NotConfigured {
                message: "no embedding API key (set TASKWING_EMBED_API_KEY or OPENAI_API_KEY)"
                    .to_string(),
            });
        }

        let vectors = match self.embed_openai(texts).await {
            Ok(v) => v,
            Err(openai_err @ LlmError::Auth { .. }) => return Err(openai_err),
            Err(openai_err) => {
                debug!(error = %openai_err, "OpenAI-shaped embed failed, trying native /embed");
                self.embed_native(texts).await.map_err(|native_err| {
                    warn!(
                        openai_error = %openai_err,
                        native_error = %native_err,
                        "Both embedding endpoints failed"
                    );
                    native_err
                })?
            }
        };

        self.validate(texts, vectors)
    }

    fn dimensions(&self) -> Option<usize> {
        self.dimensions.get().copied()
    }
}
