//! # TaskWing
//!
//! Mines a repository for architectural knowledge and turns an ambiguous
//! goal into a persisted, task-decomposed implementation plan.
//!
//! ## Pipeline
//!
//! ```text
//! goal → Retrieval (KgContext) → Clarify (rounds) → Plan Generator → Knowledge Store
//!               ↑                      │                  │
//!          Bootstrap agents       Agent Runtime ──── Streaming events
//! ```
//!
//! Every LLM-backed step runs through the [`agents::AgentRuntime`], which
//! retries transient failures, validates structured output and reports
//! progress as [`events::StreamEvent`]s. Every operation takes a
//! cancellation token.
//!
//! ## Example
//!
//! ```ignore
//! use taskwing::{Config, Pipeline};
//! use taskwing::clarify::ClarifyRequest;
//! use taskwing::events::NullSink;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = Pipeline::from_config(Config::from_env()?).await?;
//!     let cancel = CancellationToken::new();
//!     let result = pipeline
//!         .clarify()
//!         .clarify(ClarifyRequest::new("add rate limiting").with_auto_answer(), &NullSink, &cancel)
//!         .await?;
//!     println!("{}", result.enriched_goal);
//!     Ok(())
//! }
//! ```

/// Agent abstraction, typed agents and the runtime that drives them.
pub mod agents;
/// HTTP API (axum).
pub mod api;
/// Knowledge-graph ingestion from a project directory.
pub mod bootstrap;
/// Cancellation and deadline helpers.
pub mod cancel;
/// Multi-round goal clarification.
pub mod clarify;
/// Configuration management.
pub mod config;
/// Error types and result aliases.
pub mod error;
/// Streaming progress events.
pub mod events;
/// Chat, embedding and rerank providers.
pub mod llm;
/// Service wiring.
pub mod pipeline;
/// Plan generation and semantic validation.
pub mod planner;
/// System prompts for every agent.
pub mod prompts;
/// Context retrieval.
pub mod retrieval;
/// SQLite knowledge store.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult, ErrorKind};
pub use pipeline::Pipeline;
