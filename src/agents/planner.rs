use serde::{Deserialize, Deserializer, Serialize};

use super::Agent;
use crate::prompts::PLANNING_PROMPT;

/// A task as proposed by the planning agent, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProposal {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub validation_steps: Vec<String>,
    /// Titles of other proposals, or their 1-based positions.
    #[serde(default, deserialize_with = "title_or_position_list")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub suggested_recall_queries: Vec<String>,
}

fn default_priority() -> i64 {
    50
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DependencyRef {
    Title(String),
    Position(u64),
}

fn title_or_position_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let refs: Option<Vec<DependencyRef>> = Option::deserialize(deserializer)?;
    Ok(refs
        .unwrap_or_default()
        .into_iter()
        .map(|r| match r {
            DependencyRef::Title(title) => title,
            DependencyRef::Position(n) => n.to_string(),
        })
        .collect())
}

impl TaskProposal {
    /// Create a proposal with defaults
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            priority: default_priority(),
            assigned_agent: None,
            acceptance_criteria: Vec::new(),
            validation_steps: Vec::new(),
            depends_on: Vec::new(),
            scope: None,
            keywords: Vec::new(),
            suggested_recall_queries: Vec::new(),
        }
    }

    /// Set dependencies by title
    pub fn with_depends_on(mut self, titles: &[&str]) -> Self {
        self.depends_on = titles.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Set acceptance criteria
    pub fn with_acceptance_criteria(mut self, criteria: &[&str]) -> Self {
        self.acceptance_criteria = criteria.iter().map(|c| c.to_string()).collect();
        self
    }
}

/// The planning agent's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanProposal {
    pub tasks: Vec<TaskProposal>,
}

/// Decomposes an enriched goal into task proposals.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlanningAgent;

impl Agent for PlanningAgent {
    type Output = PlanProposal;

    fn name(&self) -> &str {
        "planner"
    }

    fn system_prompt(&self) -> &'static str {
        PLANNING_PROMPT
    }

    fn check(&self, output: &PlanProposal) -> Result<Option<String>, String> {
        if output.tasks.is_empty() {
            return Err("plan contains no tasks".to_string());
        }
        if output.tasks.iter().any(|t| t.title.trim().is_empty()) {
            return Err("every task needs a title".to_string());
        }
        Ok(None)
    }
}
