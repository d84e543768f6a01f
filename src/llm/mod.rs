//! LLM gateway: provider-agnostic chat, embedding and reranking.
//!
//! The pipeline only depends on the [`ChatModel`], [`Embedder`] and
//! [`Reranker`] traits; [`Gateway`] bundles one of each and adds structured
//! decoding on top of raw chat completions.

mod client;
mod embed;
mod rerank;
mod streaming;
mod types;

pub use client::ChatClient;
pub use embed::HttpEmbedder;
pub use rerank::HttpReranker;
pub use streaming::{parse_sse_line, SseEvent};
pub use types::{ChatRequest, ChatResponse, Message, MessageRole, RerankHit, Usage};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::{LlmError, LlmResult};

/// Receives streamed completion tokens.
pub type TokenSink = mpsc::UnboundedSender<String>;

/// Chat-completion provider.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Run a single completion and return the full text.
    async fn chat(&self, request: &ChatRequest) -> LlmResult<ChatResponse>;

    /// Run a completion, forwarding tokens to `tokens` as they arrive.
    ///
    /// Providers without streaming support deliver the whole completion as
    /// one token.
    async fn chat_stream(&self, request: &ChatRequest, tokens: &TokenSink) -> LlmResult<ChatResponse> {
        let response = self.chat(request).await?;
        let _ = tokens.send(response.content.clone());
        Ok(response)
    }

    /// Provider name for logging/diagnostics.
    fn name(&self) -> &str;
}

/// Batch text embedder.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `texts`, returning one vector per input in input order.
    /// Fails atomically: either every input is embedded or an error is returned.
    async fn embed(&self, texts: &[String]) -> LlmResult<Vec<Vec<f32>>>;

    /// Vector dimension, known after the first successful call.
    fn dimensions(&self) -> Option<usize>;
}

/// External relevance reranker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, texts: &[String]) -> LlmResult<Vec<RerankHit>>;
}

/// Bundle of providers the pipeline talks to.
#[derive(Clone)]
pub struct Gateway {
    chat: Arc<dyn ChatModel>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl Gateway {
    /// Create a gateway from explicit providers
    pub fn new(chat: Arc<dyn ChatModel>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            chat,
            embedder,
            reranker: None,
        }
    }

    /// Attach a reranker
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Build the HTTP-backed gateway described by `config`
    pub fn from_config(config: &Config) -> LlmResult<Self> {
        let chat = Arc::new(ChatClient::new(&config.llm, &config.request)?);
        let embedder = Arc::new(HttpEmbedder::new(&config.embedding, &config.request)?);
        let mut gateway = Self::new(chat, embedder);
        if let Some(url) = &config.rerank.base_url {
            gateway = gateway.with_reranker(Arc::new(HttpReranker::new(url, &config.request)?));
        }
        Ok(gateway)
    }

    /// The underlying chat provider
    pub fn chat_model(&self) -> &Arc<dyn ChatModel> {
        &self.chat
    }

    /// The optional reranker
    pub fn reranker(&self) -> Option<&Arc<dyn Reranker>> {
        self.reranker.as_ref()
    }

    /// Plain-text chat
    pub async fn chat(&self, request: ChatRequest) -> LlmResult<(String, Option<Usage>)> {
        let response = self.chat.chat(&request).await?;
        Ok((response.content, response.usage))
    }

    /// Embed a batch of texts
    pub async fn embed(&self, texts: &[String]) -> LlmResult<Vec<Vec<f32>>> {
        self.embedder.embed(texts).await
    }

    /// Embedding dimension once known
    pub fn dimensions(&self) -> Option<usize> {
        self.embedder.dimensions()
    }
}

/// Extract JSON from a completion string, handling markdown code blocks.
///
/// Attempts extraction in this order:
/// 1. Raw JSON (fast path)
/// 2. ```json ... ``` code blocks
/// 3. ``` ... ``` code blocks
/// 4. The outermost `{ ... }` span inside prose
pub fn extract_json_from_completion(completion: &str) -> Result<&str, String> {
    let trimmed = completion.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    if completion.contains("```json") {
        return completion
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ```json block but content was empty or malformed".to_string());
    }

    if completion.contains("```") {
        return completion
            .split("```")
            .nth(1)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ``` block but content was empty or malformed".to_string());
    }

    if let (Some(start), Some(end)) = (completion.find('{'), completion.rfind('}')) {
        if start < end {
            return Ok(&completion[start..=end]);
        }
    }

    Err(format!(
        "No JSON found in response. First 100 chars: '{}'",
        completion.chars().take(100).collect::<String>()
    ))
}

/// Decode a completion into a typed payload, reporting failures as
/// schema validation errors so the agent runtime can retry them.
pub fn decode_structured<T: DeserializeOwned>(completion: &str) -> LlmResult<T> {
    let json = extract_json_from_completion(completion)
        .map_err(|message| LlmError::SchemaValidation { message })?;
    serde_json::from_str(json).map_err(|e| LlmError::SchemaValidation {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Answer {
        answer: u32,
    }

    #[test]
    fn test_extract_raw_json() {
        assert_eq!(
            extract_json_from_completion("  {\"a\":1} ").unwrap(),
            "{\"a\":1}"
        );
    }

    #[test]
    fn test_extract_fenced_json() {
        let text = "Here you go:\n```json\n{\"answer\": 42}\n```\nDone.";
        assert_eq!(extract_json_from_completion(text).unwrap(), "{\"answer\": 42}");
    }

    #[test]
    fn test_extract_embedded_braces() {
        let text = "Sure! {\"answer\": 7} hope that helps";
        assert_eq!(extract_json_from_completion(text).unwrap(), "{\"answer\": 7}");
    }

    #[test]
    fn test_extract_no_json() {
        assert!(extract_json_from_completion("no structure here").is_err());
    }

    #[test]
    fn test_decode_structured_ok() {
        let answer: Answer = decode_structured("```json\n{\"answer\": 42}\n```").unwrap();
        assert_eq!(answer, Answer { answer: 42 });
    }

    #[test]
    fn test_decode_structured_schema_error() {
        let result: LlmResult<Answer> = decode_structured("{\"answer\": \"forty-two\"}");
        assert!(matches!(result, Err(LlmError::SchemaValidation { .. })));
    }
    /// Replies with the last message's content.
    struct EchoChat;

    #[async_trait]
    impl ChatModel for EchoChat {
        async fn chat(&self, request: &ChatRequest) -> LlmResult<ChatResponse> {
            Ok(ChatResponse {
                content: request
                    .messages
                    .last()
                    .map(|m| m.content.clone())
                    .unwrap_or_default(),
                ..Default::default()
            })
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    #[tokio::test]
    async fn test_gateway_delegates_embedding() {
        let mut embedder = MockEmbedder::new();
        embedder
            .expect_embed()
            .times(1)
            .returning(|texts| Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect()));
        embedder.expect_dimensions().return_const(Some(2usize));

        let gateway = Gateway::new(Arc::new(EchoChat), Arc::new(embedder));
        let vectors = gateway
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(gateway.dimensions(), Some(2));
        assert!(gateway.reranker().is_none());
    }

    #[tokio::test]
    async fn test_gateway_plain_chat() {
        let gateway = Gateway::new(Arc::new(EchoChat), Arc::new(MockEmbedder::new()));
        let (text, usage) = gateway
            .chat(ChatRequest::new(vec![Message::user("hello")]).with_temperature(0.0))
            .await
            .unwrap();
        assert_eq!(text, "hello");
        assert!(usage.is_none());
    }

    #[tokio::test]
    async fn test_gateway_with_reranker() {
        let mut reranker = MockReranker::new();
        reranker
            .expect_rerank()
            .withf(|query, texts| query == "q" && texts.len() == 1)
            .returning(|_, _| {
                Ok(vec![RerankHit {
                    index: 0,
                    score: 0.5,
                    text: None,
                }])
            });

        let gateway = Gateway::new(Arc::new(EchoChat), Arc::new(MockEmbedder::new()))
            .with_reranker(Arc::new(reranker));
        let hits = gateway
            .reranker()
            .unwrap()
            .rerank("q", &["only".to_string()])
            .await
            .unwrap();
        assert_eq!(hits[0].index, 0);
    }
}
