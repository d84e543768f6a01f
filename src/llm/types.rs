use serde::{Deserialize, Serialize};

/// Message in a chat conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl Message {
    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Provider-agnostic chat request
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// Ask the provider for a JSON object response.
    pub json_output: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// Create a plain-text request
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Request structured (JSON) output
    pub fn with_json_output(mut self) -> Self {
        self.json_output = true;
        self
    }

    /// Set temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set max tokens
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Provider-agnostic chat response
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub model: Option<String>,
    pub usage: Option<Usage>,
}

/// Token usage information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub(crate) struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: &'static str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletionResponse {
    pub model: Option<String>,
    pub choices: Vec<ChatChoice>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChoice {
    pub message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChoiceMessage {
    pub content: Option<String>,
}

// ---------------------------------------------------------------------------
// Embedding wire types
// ---------------------------------------------------------------------------

/// OpenAI-compatible `POST /v1/embeddings` body
#[derive(Debug, Serialize)]
pub(crate) struct OpenAiEmbeddingRequest<'a> {
    pub input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiEmbeddingResponse {
    pub data: Vec<OpenAiEmbeddingData>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiEmbeddingData {
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub index: Option<usize>,
}

/// Native embedder `POST /embed` body; the response is a bare `[[f32]]`
#[derive(Debug, Serialize)]
pub(crate) struct NativeEmbedRequest<'a> {
    pub inputs: &'a [String],
    pub truncate: bool,
}

// ---------------------------------------------------------------------------
// Rerank wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub(crate) struct RerankRequest<'a> {
    pub query: &'a str,
    pub texts: &'a [String],
    pub raw_scores: bool,
    pub truncate: bool,
}

/// One scored candidate returned by the reranker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankHit {
    /// Position of the candidate in the request's `texts`.
    pub index: usize,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}
