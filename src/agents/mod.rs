//! Agents and the runtime that executes them.
//!
//! An agent is a prompt template plus a typed output payload. The
//! [`AgentRuntime`] drives every agent through the same
//! prompt → model → parser chain.

mod bootstrap;
mod clarify;
mod planner;
mod runtime;

pub use bootstrap::{BootstrapAgent, BootstrapKind, Finding, Findings};
pub use clarify::{AutoAnswerAgent, AutoAnswers, ClarifyAgent, ClarifyProposal};
pub use planner::{PlanProposal, PlanningAgent, TaskProposal};
pub use runtime::AgentRuntime;

use serde::de::DeserializeOwned;
use std::fmt::Write as _;

use crate::llm::Message;

/// Values an agent's prompt template is filled from.
#[derive(Debug, Clone, Default)]
pub struct AgentInput {
    pub goal: String,
    pub enriched_goal: Option<String>,
    /// Retrieved knowledge-graph context.
    pub context: String,
    /// Extra labelled blocks appended after the standard ones.
    pub sections: Vec<(String, String)>,
}

impl AgentInput {
    /// Create input for a goal
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            ..Default::default()
        }
    }

    /// Set the enriched goal
    pub fn with_enriched_goal(mut self, enriched_goal: impl Into<String>) -> Self {
        self.enriched_goal = Some(enriched_goal.into());
        self
    }

    /// Set the retrieved context
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Append a labelled block
    pub fn with_section(mut self, label: impl Into<String>, body: impl Into<String>) -> Self {
        self.sections.push((label.into(), body.into()));
        self
    }

    /// Render the user message
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "## Goal\n{}\n", self.goal.trim());
        if let Some(enriched) = &self.enriched_goal {
            let _ = write!(out, "\n## Enriched goal\n{}\n", enriched.trim());
        }
        let context = self.context.trim();
        let _ = write!(
            out,
            "\n## Project knowledge\n{}\n",
            if context.is_empty() { "(none)" } else { context }
        );
        for (label, body) in &self.sections {
            let _ = write!(out, "\n## {}\n{}\n", label, body.trim());
        }
        out
    }
}

/// Result of a completed agent run.
///
/// `warning` is set when the agent finished but produced nothing
/// actionable; it is never an error.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput<T> {
    pub agent_name: String,
    pub result: T,
    pub warning: Option<String>,
}

/// A single-purpose LLM agent with a typed output payload.
pub trait Agent: Send + Sync {
    /// Structured payload decoded from the model's JSON.
    type Output: DeserializeOwned + Send;

    /// Stable agent name used in events and logs.
    fn name(&self) -> &str;

    /// System prompt for the model stage.
    fn system_prompt(&self) -> &'static str;

    /// Chat messages for the prompt stage.
    fn messages(&self, input: &AgentInput) -> Vec<Message> {
        vec![
            Message::system(self.system_prompt()),
            Message::user(input.render()),
        ]
    }

    /// Validate a decoded payload.
    ///
    /// `Err` is a schema violation and is retried; `Ok(Some(_))` is a warning.
    fn check(&self, _output: &Self::Output) -> Result<Option<String>, String> {
        Ok(None)
    }
}
