use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Agent, AgentInput, AgentOutput};
use crate::cancel;
use crate::config::RequestConfig;
use crate::error::{AppError, AppResult, LlmError, LlmResult};
use crate::events::{EventSink, NodeKind, StreamEvent};
use crate::llm::{decode_structured, ChatModel, ChatRequest, ChatResponse};

/// Executes agents as a prompt → model → parser chain with retries.
#[derive(Clone)]
pub struct AgentRuntime {
    chat: Arc<dyn ChatModel>,
    max_retries: u32,
    retry_delay_ms: u64,
    timeout_ms: u64,
}

impl AgentRuntime {
    /// Create a runtime using the retry and deadline settings in `request`
    pub fn new(chat: Arc<dyn ChatModel>, request: &RequestConfig) -> Self {
        Self {
            chat,
            max_retries: request.max_retries,
            retry_delay_ms: request.retry_delay_ms,
            timeout_ms: request.llm_timeout_ms,
        }
    }

    /// Override retry policy
    pub fn with_retries(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    /// Override the per-call deadline
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Operation deadline applied to each model call
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Run `agent` to completion.
    ///
    /// Exactly one terminal event (`AgentComplete` or `AgentError`) is
    /// emitted, and it is the last event of the run.
    pub async fn run<A: Agent>(
        &self,
        agent: &A,
        input: &AgentInput,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> AppResult<AgentOutput<A::Output>> {
        let name = agent.name().to_string();
        let start = Instant::now();

        sink.emit(StreamEvent::NodeStart {
            agent: name.clone(),
            node: NodeKind::Prompt,
        });
        let request = ChatRequest::new(agent.messages(input)).with_json_output();

        let mut attempt = 0u32;
        loop {
            sink.emit(StreamEvent::NodeStart {
                agent: name.clone(),
                node: NodeKind::Model,
            });

            let outcome = match cancel::with_deadline(
                cancel,
                self.timeout_ms,
                self.call_model(&name, &request, sink),
            )
            .await
            {
                Ok(response) => {
                    sink.emit(StreamEvent::NodeStart {
                        agent: name.clone(),
                        node: NodeKind::Parser,
                    });
                    parse_output(agent, &response.content).map_err(AppError::from)
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok((result, warning)) => {
                    info!(
                        agent = %name,
                        attempts = attempt + 1,
                        latency_ms = start.elapsed().as_millis(),
                        warning = warning.as_deref().unwrap_or(""),
                        "Agent completed"
                    );
                    sink.emit(StreamEvent::AgentComplete {
                        agent: name.clone(),
                        warning: warning.clone(),
                    });
                    return Ok(AgentOutput {
                        agent_name: name,
                        result,
                        warning,
                    });
                }
                Err(AppError::Llm(e)) if e.is_retryable() => {
                    if attempt >= self.max_retries {
                        warn!(agent = %name, attempts = attempt + 1, error = %e, "Agent retries exhausted");
                        let message = e.to_string();
                        sink.emit(StreamEvent::AgentError {
                            agent: name.clone(),
                            message: message.clone(),
                        });
                        return Err(AppError::Agent {
                            agent: name,
                            message,
                        });
                    }

                    attempt += 1;
                    let delay = self.backoff(attempt, &e);
                    warn!(
                        agent = %name,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Agent step failed, retrying"
                    );
                    sink.emit(StreamEvent::Retry {
                        agent: name.clone(),
                        attempt,
                        reason: e.to_string(),
                    });

                    if let Err(e) = cancel::sleep(cancel, delay).await {
                        sink.emit(StreamEvent::AgentError {
                            agent: name.clone(),
                            message: e.user_message(),
                        });
                        return Err(e);
                    }
                }
                Err(e) => {
                    warn!(agent = %name, error = %e, "Agent failed");
                    sink.emit(StreamEvent::AgentError {
                        agent: name.clone(),
                        message: e.user_message(),
                    });
                    return Err(e);
                }
            }
        }
    }

    /// Call the model, forwarding streamed tokens as events.
    async fn call_model(
        &self,
        agent: &str,
        request: &ChatRequest,
        sink: &dyn EventSink,
    ) -> LlmResult<ChatResponse> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let call = self.chat.chat_stream(request, &tx);
        tokio::pin!(call);

        let result = loop {
            tokio::select! {
                result = &mut call => break result,
                Some(text) = rx.recv() => sink.emit(StreamEvent::Token {
                    agent: agent.to_string(),
                    text,
                }),
            }
        };
        while let Ok(text) = rx.try_recv() {
            sink.emit(StreamEvent::Token {
                agent: agent.to_string(),
                text,
            });
        }

        debug!(agent, model = self.chat.name(), ok = result.is_ok(), "Model stage finished");
        result
    }

    /// Exponential backoff, stretched to honour a server Retry-After.
    fn backoff(&self, attempt: u32, error: &LlmError) -> Duration {
        let exp = self
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let ms = match error {
            LlmError::RateLimited {
                retry_after_ms: Some(after),
            } => exp.max(*after),
            _ => exp,
        };
        Duration::from_millis(ms)
    }
}

fn parse_output<A: Agent>(agent: &A, content: &str) -> LlmResult<(A::Output, Option<String>)> {
    let output: A::Output = decode_structured(content)?;
    let warning = agent
        .check(&output)
        .map_err(|message| LlmError::SchemaValidation { message })?;
    Ok((output, warning))
}
