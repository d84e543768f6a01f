use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, Response, StatusCode};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::streaming::{SseBuffer, SseEvent};
use super::types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatRequest, ChatResponse, ResponseFormat,
};
use super::{ChatModel, TokenSink};
use crate::config::{LlmConfig, LlmProvider, RequestConfig};
use crate::error::{LlmError, LlmResult};

/// Client for OpenAI-compatible chat completion APIs (cloud or self-hosted)
#[derive(Clone)]
pub struct ChatClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    provider: LlmProvider,
    timeout_ms: u64,
}

impl ChatClient {
    /// Create a new chat client
    pub fn new(config: &LlmConfig, request_config: &RequestConfig) -> LlmResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(LlmError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            provider: config.provider,
            timeout_ms: request_config.timeout_ms,
        })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn check_configured(&self) -> LlmResult<()> {
        if self.provider == LlmProvider::OpenAi && self.api_key.is_none() {
            return Err(LlmError::NotConfigured {
                message: "no API key for the cloud chat provider (set OPENAI_API_KEY)".to_string(),
            });
        }
        Ok(())
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> LlmResult<Response> {
        self.check_configured()?;

        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: &request.messages,
            stream,
            response_format: request.json_output.then_some(ResponseFormat {
                format_type: "json_object",
            }),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        debug!(
            model = %self.model,
            messages = request.messages.len(),
            stream,
            "Sending chat completion request"
        );

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout_ms))?;

        check_status(response).await
    }
}

#[async_trait]
impl ChatModel for ChatClient {
    async fn chat(&self, request: &ChatRequest) -> LlmResult<ChatResponse> {
        let start = Instant::now();
        let response = self.send(request, false).await?;

        let parsed: ChatCompletionResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse {
                    message: format!("Failed to parse chat response: {}", e),
                })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidResponse {
                message: "no content in chat response".to_string(),
            })?;

        info!(
            model = %self.model,
            latency_ms = start.elapsed().as_millis(),
            "Chat completion succeeded"
        );

        Ok(ChatResponse {
            content,
            model: parsed.model,
            usage: parsed.usage,
        })
    }

    async fn chat_stream(&self, request: &ChatRequest, tokens: &TokenSink) -> LlmResult<ChatResponse> {
        let start = Instant::now();
        let response = self.send(request, true).await?;

        let mut bytes = response.bytes_stream();
        let mut buffer = SseBuffer::default();
        let mut result = ChatResponse::default();

        'read: while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| map_send_error(e, self.timeout_ms))?;
            for event in buffer.push(&chunk) {
                if !apply_sse_event(event, &mut result, tokens) {
                    break 'read;
                }
            }
        }
        if let Some(event) = buffer.finish() {
            apply_sse_event(event, &mut result, tokens);
        }

        info!(
            model = %self.model,
            latency_ms = start.elapsed().as_millis(),
            chars = result.content.len(),
            "Streaming chat completion finished"
        );

        Ok(result)
    }

    fn name(&self) -> &str {
        match self.provider {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Local => "local",
        }
    }
}

/// Fold one SSE event into the response; returns false once the stream is done.
fn apply_sse_event(event: SseEvent, result: &mut ChatResponse, tokens: &TokenSink) -> bool {
    match event {
        SseEvent::Delta {
            content,
            model,
            usage,
        } => {
            if !content.is_empty() {
                // Receiver may have gone away; the response is still assembled.
                let _ = tokens.send(content.clone());
                result.content.push_str(&content);
            }
            if model.is_some() {
                result.model = model;
            }
            if usage.is_some() {
                result.usage = usage;
            }
            true
        }
        SseEvent::Done => false,
        SseEvent::Error(message) => {
            warn!(error = %message, "Skipping malformed stream chunk");
            true
        }
    }
}

/// Map a transport-level reqwest error into the gateway taxonomy.
pub(crate) fn map_send_error(e: reqwest::Error, timeout_ms: u64) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout { timeout_ms }
    } else {
        LlmError::Http(e)
    }
}

/// Turn non-2xx responses into typed errors.
pub(crate) async fn check_status(response: Response) -> LlmResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after_ms = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs * 1000);
    let body = response.text().await.unwrap_or_default();

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::Auth { message: body },
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited { retry_after_ms },
        _ => LlmError::Upstream {
            status: status.as_u16(),
            body,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: LlmProvider, api_key: Option<&str>) -> LlmConfig {
        LlmConfig {
            provider,
            base_url: "http://localhost:11434/v1/".to_string(),
            model: "llama3".to_string(),
            api_key: api_key.map(String::from),
        }
    }

    #[test]
    fn test_client_creation_trims_base_url() {
        let client = ChatClient::new(&config(LlmProvider::Local, None), &RequestConfig::default())
            .unwrap();
        assert_eq!(client.base_url(), "http://localhost:11434/v1");
        assert_eq!(client.name(), "local");
    }

    #[test]
    fn test_cloud_provider_without_key_is_not_configured() {
        let client = ChatClient::new(&config(LlmProvider::OpenAi, None), &RequestConfig::default())
            .unwrap();
        assert!(matches!(
            client.check_configured(),
            Err(LlmError::NotConfigured { .. })
        ));

        let client = ChatClient::new(
            &config(LlmProvider::OpenAi, Some("sk-test")),
            &RequestConfig::default(),
        )
        .unwrap();
        assert!(client.check_configured().is_ok());
    }
}
