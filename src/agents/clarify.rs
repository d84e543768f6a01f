use serde::{Deserialize, Serialize};

use super::Agent;
use crate::prompts::{AUTO_ANSWER_PROMPT, CLARIFY_PROMPT};

/// One round's proposal from the clarification agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarifyProposal {
    pub enriched_goal: String,
    #[serde(default)]
    pub goal_summary: String,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default)]
    pub is_ready_to_plan: bool,
}

/// Proposes an enriched goal and the questions still blocking it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClarifyAgent;

impl Agent for ClarifyAgent {
    type Output = ClarifyProposal;

    fn name(&self) -> &str {
        "clarify"
    }

    fn system_prompt(&self) -> &'static str {
        CLARIFY_PROMPT
    }

    fn check(&self, output: &ClarifyProposal) -> Result<Option<String>, String> {
        if output.enriched_goal.trim().is_empty() {
            return Err("enriched_goal must not be empty".to_string());
        }
        if !output.is_ready_to_plan && output.questions.iter().all(|q| q.trim().is_empty()) {
            return Ok(Some("agent is not ready but asked no questions".to_string()));
        }
        Ok(None)
    }
}

/// Model-generated answers to outstanding clarification questions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoAnswers {
    #[serde(default)]
    pub answers: Vec<String>,
}

/// Answers clarification questions on the user's behalf.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAnswerAgent;

impl Agent for AutoAnswerAgent {
    type Output = AutoAnswers;

    fn name(&self) -> &str {
        "auto_answer"
    }

    fn system_prompt(&self) -> &'static str {
        AUTO_ANSWER_PROMPT
    }

    fn check(&self, output: &AutoAnswers) -> Result<Option<String>, String> {
        if output.answers.is_empty() {
            return Ok(Some("no answers produced".to_string()));
        }
        Ok(None)
    }
}
