//! Storage layer for the knowledge graph and the planning pipeline.
//!
//! This module provides SQLite-based storage for knowledge nodes and edges,
//! plans, tasks, clarification sessions and the activity log, plus the
//! brute-force cosine index used by retrieval.

mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};

/// Kind of architectural knowledge a node carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Decision,
    Feature,
    Constraint,
    Pattern,
    Plan,
    Note,
    Metadata,
    Documentation,
}

impl NodeType {
    /// Every node type, in display order.
    pub const ALL: [NodeType; 8] = [
        NodeType::Decision,
        NodeType::Feature,
        NodeType::Constraint,
        NodeType::Pattern,
        NodeType::Plan,
        NodeType::Note,
        NodeType::Metadata,
        NodeType::Documentation,
    ];

    /// Get the type name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Decision => "decision",
            NodeType::Feature => "feature",
            NodeType::Constraint => "constraint",
            NodeType::Pattern => "pattern",
            NodeType::Plan => "plan",
            NodeType::Note => "note",
            NodeType::Metadata => "metadata",
            NodeType::Documentation => "documentation",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeType::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| format!("Unknown node type: {}", s))
    }
}

/// One unit of architectural knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier.
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Short headline.
    pub summary: String,
    /// Full markdown body.
    pub content: String,
    /// Embedding vector; never serialized over the API.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    /// Tag identifying the producer (bootstrap agent name, "user", ...).
    pub source_agent: String,
    pub created_at: DateTime<Utc>,
}

/// Maximum summary length kept on a node.
pub const MAX_SUMMARY_CHARS: usize = 200;

impl Node {
    /// Create a new node
    pub fn new(node_type: NodeType, summary: impl Into<String>, content: impl Into<String>) -> Self {
        let summary: String = summary.into();
        Self {
            id: Uuid::new_v4().to_string(),
            node_type,
            summary: summary.chars().take(MAX_SUMMARY_CHARS).collect(),
            content: content.into(),
            embedding: None,
            source_agent: "user".to_string(),
            created_at: Utc::now(),
        }
    }

    /// Set the embedding
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Set the producing agent
    pub fn with_source_agent(mut self, agent: impl Into<String>) -> Self {
        self.source_agent = agent.into();
        self
    }

    /// Text used for embedding and reranking.
    pub fn embedding_text(&self) -> String {
        format!("{}\n\n{}", self.summary, self.content)
    }
}

/// Relation types used between nodes.
pub mod relation {
    pub const RELATES_TO: &str = "relates_to";
    pub const SEMANTICALLY_SIMILAR: &str = "semantically_similar";
    pub const DEPENDS_ON: &str = "depends_on";
}

/// Directed, typed, weighted relation between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from_node: String,
    pub to_node: String,
    pub relation: String,
    /// Confidence in [0, 1].
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    /// Create a new edge
    pub fn new(
        from_node: impl Into<String>,
        to_node: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            from_node: from_node.into(),
            to_node: to_node.into(),
            relation: relation.into(),
            confidence: 1.0,
            created_at: Utc::now(),
        }
    }

    /// Set confidence
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// The endpoint on the other side of `node_id`.
    pub fn other_end(&self, node_id: &str) -> &str {
        if self.from_node == node_id {
            &self.to_node
        } else {
            &self.from_node
        }
    }
}

/// Lifecycle of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Active,
    Done,
    Cancelled,
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStatus::Active => write!(f, "active"),
            PlanStatus::Done => write!(f, "done"),
            PlanStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for PlanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(PlanStatus::Active),
            "done" => Ok(PlanStatus::Done),
            "cancelled" => Ok(PlanStatus::Cancelled),
            _ => Err(format!("Unknown plan status: {}", s)),
        }
    }
}

/// A persisted collection of tasks derived from an enriched goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    /// Verbatim user input.
    pub goal: String,
    /// Post-clarification technical specification.
    pub enriched_goal: String,
    /// One-line summary for UI headers (at most 100 chars).
    pub goal_summary: String,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Create a new active plan
    pub fn new(goal: impl Into<String>, enriched_goal: impl Into<String>) -> Self {
        let enriched_goal = enriched_goal.into();
        Self {
            id: Uuid::new_v4().to_string(),
            goal: goal.into(),
            goal_summary: crate::clarify::truncate_summary(&enriched_goal),
            enriched_goal,
            status: PlanStatus::Active,
            created_at: Utc::now(),
        }
    }

    /// Set the goal summary (truncated to the summary limit)
    pub fn with_summary(mut self, summary: &str) -> Self {
        self.goal_summary = crate::clarify::truncate_summary(summary);
        self
    }
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Blocked,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Blocked => write!(f, "blocked"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "done" => Ok(TaskStatus::Done),
            "blocked" => Ok(TaskStatus::Blocked),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// A single actionable unit within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub plan_id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// Higher is more urgent; not unique.
    pub priority: i32,
    pub assigned_agent: Option<String>,
    pub acceptance_criteria: Vec<String>,
    pub validation_steps: Vec<String>,
    /// Ids of tasks in the same plan that must finish first.
    pub depends_on: Vec<String>,
    pub scope: Option<String>,
    pub keywords: Vec<String>,
    pub suggested_recall_queries: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending task in a plan
    pub fn new(plan_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            plan_id: plan_id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: 50,
            assigned_agent: None,
            acceptance_criteria: Vec::new(),
            validation_steps: Vec::new(),
            depends_on: Vec::new(),
            scope: None,
            keywords: Vec::new(),
            suggested_recall_queries: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set dependencies
    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    /// Set acceptance criteria
    pub fn with_acceptance_criteria(mut self, criteria: Vec<String>) -> Self {
        self.acceptance_criteria = criteria;
        self
    }
}

/// One clarification round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarifyRound {
    pub draft_enriched_goal: String,
    pub goal_summary: String,
    pub questions: Vec<String>,
    /// Answers aligned with `questions`; empty until the next call folds them in.
    #[serde(default)]
    pub answers: Vec<String>,
    /// Whether the answers were generated by the model rather than the user.
    #[serde(default)]
    pub auto_answered: bool,
    /// The agent's own readiness verdict for this round.
    pub verdict: bool,
}

/// Stateful multi-round clarification record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarifySession {
    pub id: String,
    pub goal: String,
    /// Knowledge-graph context captured when the session was created.
    pub context: String,
    pub rounds: Vec<ClarifyRound>,
    pub max_rounds: u32,
    pub is_ready_to_plan: bool,
    pub final_enriched_goal: Option<String>,
    pub goal_summary: String,
    /// Set once a plan has been generated from this session.
    pub plan_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClarifySession {
    /// Create a new session
    pub fn new(goal: impl Into<String>, context: impl Into<String>, max_rounds: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            goal: goal.into(),
            context: context.into(),
            rounds: Vec::new(),
            max_rounds: max_rounds.max(1),
            is_ready_to_plan: false,
            final_enriched_goal: None,
            goal_summary: String::new(),
            plan_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The most recent round, if any
    pub fn last_round(&self) -> Option<&ClarifyRound> {
        self.rounds.last()
    }

    /// The best enriched goal known so far
    pub fn current_enriched_goal(&self) -> &str {
        self.final_enriched_goal
            .as_deref()
            .or_else(|| self.last_round().map(|r| r.draft_enriched_goal.as_str()))
            .unwrap_or(&self.goal)
    }
}

/// An entry in the activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: String,
    /// Category, e.g. "search", "bootstrap", "finding", "plan".
    pub kind: String,
    pub summary: String,
    pub detail: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ActivityEntry {
    /// Create a new activity entry
    pub fn new(kind: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            summary: summary.into(),
            detail: None,
            created_at: Utc::now(),
        }
    }

    /// Attach structured detail
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}

/// Check that every dependency points inside `tasks` and that the
/// dependency graph is acyclic.
pub fn validate_task_graph(tasks: &[Task]) -> StorageResult<()> {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for task in tasks {
        if let Some(missing) = task.depends_on.iter().find(|d| !ids.contains(d.as_str())) {
            return Err(StorageError::Conflict {
                message: format!("task {} depends on unknown task {}", task.id, missing),
            });
        }
    }

    // Kahn's algorithm: anything left over sits on a cycle.
    let mut indegree: HashMap<&str, usize> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.depends_on.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        for dep in &task.depends_on {
            dependents.entry(dep.as_str()).or_default().push(task.id.as_str());
        }
    }

    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = ready.pop() {
        visited += 1;
        for next in dependents.get(id).into_iter().flatten() {
            if let Some(d) = indegree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    ready.push(next);
                }
            }
        }
    }

    if visited != tasks.len() {
        return Err(StorageError::Conflict {
            message: "task dependencies contain a cycle".to_string(),
        });
    }
    Ok(())
}

/// Storage trait for knowledge-graph and planning persistence
#[async_trait]
pub trait Storage: Send + Sync {
    // Node operations

    /// Persist a node. An embedding must match the store's dimension,
    /// which is recorded on the first embedded write.
    async fn create_node(&self, node: &Node) -> StorageResult<()>;
    /// Get a node by ID
    async fn get_node(&self, id: &str) -> StorageResult<Option<Node>>;
    /// List nodes, oldest first, optionally filtered by type
    async fn list_nodes(&self, type_filter: Option<NodeType>) -> StorageResult<Vec<Node>>;
    /// Node counts grouped by type
    async fn count_nodes_by_type(&self) -> StorageResult<Vec<(NodeType, i64)>>;
    /// Node counts grouped by producing agent
    async fn count_nodes_by_agent(&self) -> StorageResult<Vec<(String, i64)>>;
    /// Delete every node and edge and forget the embedding dimension
    async fn clear_all_knowledge(&self) -> StorageResult<()>;
    /// Optionally clear, then write `nodes` and `edges`, all in one
    /// transaction; any failure leaves the previous graph in place
    async fn replace_knowledge(
        &self,
        clear: bool,
        nodes: &[Node],
        edges: &[Edge],
    ) -> StorageResult<()>;
    /// Embedding dimension recorded by the first embedded write
    async fn embedding_dimensions(&self) -> StorageResult<Option<usize>>;
    /// Top-`k` nodes by cosine similarity, descending; ties go to the older node
    async fn vector_search(&self, query: &[f32], k: usize) -> StorageResult<Vec<(Node, f32)>>;

    // Edge operations

    /// Persist an edge between two existing nodes
    async fn create_edge(&self, edge: &Edge) -> StorageResult<()>;
    /// All edges
    async fn get_all_node_edges(&self) -> StorageResult<Vec<Edge>>;
    /// Edges touching `node_id` in either direction, strongest first
    async fn neighbors(&self, node_id: &str) -> StorageResult<Vec<Edge>>;

    // Plan operations

    /// Create a plan
    async fn create_plan(&self, plan: &Plan) -> StorageResult<()>;
    /// Get a plan by ID
    async fn get_plan(&self, id: &str) -> StorageResult<Option<Plan>>;
    /// List plans, newest first
    async fn list_plans(&self) -> StorageResult<Vec<Plan>>;
    /// Change a plan's status
    async fn update_plan_status(&self, id: &str, status: PlanStatus) -> StorageResult<()>;
    /// Persist a plan and its tasks in a single transaction
    async fn create_plan_with_tasks(&self, plan: &Plan, tasks: &[Task]) -> StorageResult<()>;
    /// Persist a plan for a clarify session, claiming the session in the
    /// same transaction. `Conflict` if the session already has a plan.
    async fn create_session_plan(
        &self,
        session_id: &str,
        plan: &Plan,
        tasks: &[Task],
    ) -> StorageResult<()>;

    // Task operations

    /// Create a task in an existing plan; dependencies must already exist in that plan
    async fn create_task(&self, task: &Task) -> StorageResult<()>;
    /// Get a task by ID
    async fn get_task(&self, id: &str) -> StorageResult<Option<Task>>;
    /// Tasks of a plan in insertion order
    async fn list_tasks(&self, plan_id: &str) -> StorageResult<Vec<Task>>;
    /// Change a task's status
    async fn update_task_status(&self, id: &str, status: TaskStatus) -> StorageResult<()>;

    // Clarify session operations

    /// Insert or update a clarify session; a recorded `plan_id` is never cleared
    async fn save_clarify_session(&self, session: &ClarifySession) -> StorageResult<()>;
    /// Get a clarify session by ID
    async fn get_clarify_session(&self, id: &str) -> StorageResult<Option<ClarifySession>>;

    // Activity operations

    /// Append an activity entry
    async fn log_activity(&self, entry: &ActivityEntry) -> StorageResult<()>;
    /// Most recent entries first
    async fn list_activity(&self, limit: usize) -> StorageResult<Vec<ActivityEntry>>;
    /// Get an activity entry by ID
    async fn get_activity(&self, id: &str) -> StorageResult<Option<ActivityEntry>>;
    /// Remove all activity entries
    async fn clear_activity(&self) -> StorageResult<()>;
}
