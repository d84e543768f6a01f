//! Shared fixtures for integration tests: scripted providers and a
//! pipeline over an in-memory store.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskwing::config::Config;
use taskwing::error::{LlmError, LlmResult};
use taskwing::llm::{ChatModel, ChatRequest, ChatResponse, Embedder, Gateway};
use taskwing::storage::SqliteStorage;
use taskwing::Pipeline;

/// One scripted chat reply.
pub enum Reply {
    Text(String),
    /// Reply after sleeping on the tokio clock.
    Delayed(Duration, String),
    Status(u16),
}

impl Reply {
    pub fn json(value: serde_json::Value) -> Self {
        Reply::Text(value.to_string())
    }
}

/// Chat model that plays back replies in order and records every request.
#[derive(Default)]
pub struct ScriptedChat {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChat {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// System prompts of every request, in call order.
    pub fn system_prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| r.messages.first().map(|m| m.content.clone()))
            .collect()
    }

    /// User message of the most recent request.
    pub fn last_user_message(&self) -> Option<String> {
        self.requests
            .lock()
            .unwrap()
            .last()
            .and_then(|r| r.messages.last().map(|m| m.content.clone()))
    }

    /// The most recent request.
    pub fn last_request(&self) -> Option<ChatRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    async fn chat(&self, request: &ChatRequest) -> LlmResult<ChatResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.replies.lock().unwrap().pop_front();
        let content = match reply {
            Some(Reply::Text(text)) => text,
            Some(Reply::Delayed(delay, text)) => {
                tokio::time::sleep(delay).await;
                text
            }
            Some(Reply::Status(status)) => {
                return Err(LlmError::Upstream {
                    status,
                    body: "scripted failure".to_string(),
                })
            }
            None => {
                return Err(LlmError::InvalidResponse {
                    message: "no scripted reply left".to_string(),
                })
            }
        };
        Ok(ChatResponse {
            content,
            ..Default::default()
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Embedder computing vectors with a caller-supplied function.
pub struct FnEmbedder {
    embed: Box<dyn Fn(&str) -> Vec<f32> + Send + Sync>,
    calls: Mutex<usize>,
}

impl FnEmbedder {
    pub fn new(embed: impl Fn(&str) -> Vec<f32> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            embed: Box::new(embed),
            calls: Mutex::new(0),
        })
    }

    /// Same vector for every text.
    pub fn constant(vector: Vec<f32>) -> Arc<Self> {
        Self::new(move |_| vector.clone())
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Embedder for FnEmbedder {
    async fn embed(&self, texts: &[String]) -> LlmResult<Vec<Vec<f32>>> {
        *self.calls.lock().unwrap() += 1;
        Ok(texts.iter().map(|t| (self.embed)(t)).collect())
    }

    fn dimensions(&self) -> Option<usize> {
        None
    }
}

/// Defaults with query rewriting off and fast retries.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retrieval.rewrite_queries = false;
    config.request.retry_delay_ms = 1;
    config
}

pub async fn memory_storage() -> SqliteStorage {
    SqliteStorage::new_in_memory()
        .await
        .expect("Failed to create in-memory storage")
}

/// Pipeline over a fresh in-memory store.
pub async fn pipeline(chat: Arc<ScriptedChat>, embedder: Arc<FnEmbedder>) -> Pipeline {
    pipeline_with(test_config(), chat, embedder).await
}

pub async fn pipeline_with(
    config: Config,
    chat: Arc<ScriptedChat>,
    embedder: Arc<FnEmbedder>,
) -> Pipeline {
    let storage = memory_storage().await;
    Pipeline::new(config, storage, Gateway::new(chat, embedder))
}
