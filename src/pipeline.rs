//! The planning pipeline assembled from configuration.
//!
//! [`Pipeline`] owns one instance of every service and hands out cheap
//! clones of them to the HTTP handlers and CLI commands. It also carries
//! the small operations that only compose existing services: search with
//! an optional answer, manual plan creation and promotion of activity
//! findings into tasks.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agents::{AgentRuntime, TaskProposal};
use crate::bootstrap::BootstrapService;
use crate::cancel::{cancellable, with_deadline};
use crate::clarify::{ClarifyEngine, SessionLocks};
use crate::config::Config;
use crate::error::{AppError, AppResult, StorageError};
use crate::llm::{ChatRequest, Gateway, Message};
use crate::planner::{validate_proposals, PlanGenerator, ValidationReport};
use crate::prompts::SEARCH_ANSWER_PROMPT;
use crate::retrieval::{RetrievalService, ScoredNode};
use crate::storage::{ActivityEntry, Plan, PlanStatus, SqliteStorage, Storage, Task};

/// Goal of the plan that collects promoted findings.
pub const PROMOTED_PLAN_GOAL: &str = "Promoted findings";

/// Sampling for search answers: grounded, short.
const ANSWER_TEMPERATURE: f32 = 0.2;
const ANSWER_MAX_TOKENS: u32 = 800;

/// Upper bound on search results per request.
pub const MAX_SEARCH_LIMIT: usize = 50;

/// Search input.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Ask the chat model to answer from the results.
    #[serde(default)]
    pub answer: bool,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: None,
            answer: false,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_answer(mut self, answer: bool) -> Self {
        self.answer = answer;
        self
    }
}

/// Search output.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<ScoredNode>,
    /// Empty unless an answer was requested and results exist.
    pub answer: String,
}

/// Manually authored plan.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePlanRequest {
    pub goal: String,
    #[serde(default, alias = "enrichedGoal")]
    pub enriched_goal: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskProposal>,
}

/// A created plan with its tasks and validation findings.
#[derive(Debug, Clone, Serialize)]
pub struct PlanWithTasks {
    pub plan: Plan,
    pub tasks: Vec<Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
}

/// Promote an activity entry into a task.
#[derive(Debug, Clone, Deserialize)]
pub struct PromoteRequest {
    #[serde(alias = "activityId")]
    pub activity_id: String,
    /// Target plan; defaults to the active "Promoted findings" plan.
    #[serde(default, alias = "planId")]
    pub plan_id: Option<String>,
}

/// Result of a promotion.
#[derive(Debug, Clone, Serialize)]
pub struct PromoteResult {
    pub plan_id: String,
    pub plan_created: bool,
    pub task: Task,
}

/// Every pipeline service, wired once.
#[derive(Clone)]
pub struct Pipeline {
    config: Config,
    storage: SqliteStorage,
    gateway: Gateway,
    runtime: AgentRuntime,
    retrieval: RetrievalService,
    clarify: ClarifyEngine,
    planner: PlanGenerator,
    bootstrap: BootstrapService,
}

impl Pipeline {
    /// Wire the services over an existing store and gateway.
    pub fn new(config: Config, storage: SqliteStorage, gateway: Gateway) -> Self {
        let timeout_ms = config.request.llm_timeout_ms;
        let runtime = AgentRuntime::new(gateway.chat_model().clone(), &config.request);
        let retrieval = RetrievalService::new(
            storage.clone(),
            gateway.clone(),
            config.retrieval.clone(),
            timeout_ms,
        );
        let session_locks = SessionLocks::new();
        let clarify = ClarifyEngine::new(
            storage.clone(),
            runtime.clone(),
            retrieval.clone(),
            config.clarify.max_rounds,
        )
        .with_session_locks(session_locks.clone());
        let planner = PlanGenerator::new(
            storage.clone(),
            runtime.clone(),
            retrieval.clone(),
            config.retrieval.plan_top_k,
        )
        .with_session_locks(session_locks);
        let bootstrap =
            BootstrapService::new(storage.clone(), gateway.clone(), runtime.clone(), timeout_ms);

        info!(
            model = %config.llm.model,
            reranker = gateway.reranker().is_some(),
            max_rounds = config.clarify.max_rounds,
            "Pipeline initialized"
        );

        Self {
            config,
            storage,
            gateway,
            runtime,
            retrieval,
            clarify,
            planner,
            bootstrap,
        }
    }

    /// Open the store and build the HTTP gateway described by `config`.
    pub async fn from_config(config: Config) -> AppResult<Self> {
        let storage = SqliteStorage::new(&config.database).await?;
        let gateway = Gateway::from_config(&config)?;
        Ok(Self::new(config, storage, gateway))
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    #[inline]
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    #[inline]
    pub fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    #[inline]
    pub fn retrieval(&self) -> &RetrievalService {
        &self.retrieval
    }

    #[inline]
    pub fn clarify(&self) -> &ClarifyEngine {
        &self.clarify
    }

    #[inline]
    pub fn planner(&self) -> &PlanGenerator {
        &self.planner
    }

    #[inline]
    pub fn bootstrap(&self) -> &BootstrapService {
        &self.bootstrap
    }

    /// Ranked knowledge for a query, optionally answered by the chat model.
    ///
    /// No results means an empty answer and no chat call.
    pub async fn search(
        &self,
        request: SearchRequest,
        cancel: &CancellationToken,
    ) -> AppResult<SearchResponse> {
        let limit = request
            .limit
            .unwrap_or(self.config.retrieval.rerank_top_k)
            .clamp(1, MAX_SEARCH_LIMIT);
        let options = self.retrieval.options().with_rerank_top_k(limit);
        let context = self
            .retrieval
            .retrieve_with(&request.query, &options, cancel)
            .await?;

        let mut results = context.scored_nodes;
        results.truncate(limit);

        let answer = if request.answer && !results.is_empty() {
            let messages = vec![
                Message::system(SEARCH_ANSWER_PROMPT),
                Message::user(format!(
                    "## Question\n{}\n\n## Project knowledge\n{}",
                    request.query.trim(),
                    context.context_text
                )),
            ];
            let (text, _usage) = with_deadline(
                cancel,
                self.config.request.llm_timeout_ms,
                self.gateway.chat(
                    ChatRequest::new(messages)
                        .with_temperature(ANSWER_TEMPERATURE)
                        .with_max_tokens(ANSWER_MAX_TOKENS),
                ),
            )
            .await?;
            text.trim().to_string()
        } else {
            String::new()
        };

        info!(
            query = %request.query,
            results = results.len(),
            strategy = %context.strategy,
            answered = !answer.is_empty(),
            "Search completed"
        );
        Ok(SearchResponse { results, answer })
    }

    /// Persist a hand-written plan; task proposals go through the same
    /// validation as generated ones.
    pub async fn create_plan(
        &self,
        request: CreatePlanRequest,
        cancel: &CancellationToken,
    ) -> AppResult<PlanWithTasks> {
        let goal = request.goal.trim();
        if goal.is_empty() {
            return Err(AppError::user("goal must not be empty"));
        }
        let enriched = request
            .enriched_goal
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .unwrap_or(goal);

        let plan = Plan::new(goal, enriched);
        let (tasks, report) = validate_proposals(&plan.id, request.tasks);
        cancellable(cancel, self.storage.create_plan_with_tasks(&plan, &tasks)).await?;

        self.log(ActivityEntry::new("plan", format!("Created plan: {}", plan.goal_summary))
            .with_detail(serde_json::json!({ "plan_id": plan.id, "tasks": tasks.len() })))
            .await;

        Ok(PlanWithTasks {
            plan,
            tasks,
            validation: Some(report),
        })
    }

    /// A plan and its tasks.
    pub async fn plan_with_tasks(
        &self,
        plan_id: &str,
        cancel: &CancellationToken,
    ) -> AppResult<PlanWithTasks> {
        let plan = cancellable(cancel, self.storage.get_plan(plan_id))
            .await?
            .ok_or_else(|| not_found("plan", plan_id))?;
        let tasks = cancellable(cancel, self.storage.list_tasks(plan_id)).await?;
        Ok(PlanWithTasks {
            plan,
            tasks,
            validation: None,
        })
    }

    /// Turn an activity entry into a task, creating the target plan if needed.
    pub async fn promote(
        &self,
        request: PromoteRequest,
        cancel: &CancellationToken,
    ) -> AppResult<PromoteResult> {
        let entry = cancellable(cancel, self.storage.get_activity(&request.activity_id))
            .await?
            .ok_or_else(|| not_found("activity", &request.activity_id))?;

        let (plan_id, plan_created) = match &request.plan_id {
            Some(id) => {
                let plan = cancellable(cancel, self.storage.get_plan(id))
                    .await?
                    .ok_or_else(|| not_found("plan", id))?;
                (plan.id, false)
            }
            None => self.promoted_plan(cancel).await?,
        };

        let description = entry
            .detail
            .as_ref()
            .map(|d| match d.get("content").and_then(|c| c.as_str()) {
                Some(content) => content.to_string(),
                None => d.to_string(),
            })
            .unwrap_or_else(|| entry.summary.clone());
        let task = Task::new(&plan_id, entry.summary.clone()).with_description(description);
        cancellable(cancel, self.storage.create_task(&task)).await?;

        self.log(ActivityEntry::new("promote", format!("Promoted to task: {}", task.title))
            .with_detail(serde_json::json!({
                "activity_id": entry.id,
                "plan_id": plan_id,
                "task_id": task.id,
            })))
            .await;

        Ok(PromoteResult {
            plan_id,
            plan_created,
            task,
        })
    }

    /// The active promoted-findings plan, created on first use.
    async fn promoted_plan(&self, cancel: &CancellationToken) -> AppResult<(String, bool)> {
        let plans = cancellable(cancel, self.storage.list_plans()).await?;
        if let Some(plan) = plans
            .into_iter()
            .find(|p| p.goal == PROMOTED_PLAN_GOAL && p.status == PlanStatus::Active)
        {
            return Ok((plan.id, false));
        }
        let plan = Plan::new(PROMOTED_PLAN_GOAL, PROMOTED_PLAN_GOAL);
        cancellable(cancel, self.storage.create_plan(&plan)).await?;
        Ok((plan.id, true))
    }

    async fn log(&self, entry: ActivityEntry) {
        if let Err(e) = self.storage.log_activity(&entry).await {
            warn!(kind = %entry.kind, error = %e, "Failed to log activity");
        }
    }
}

fn not_found(entity: &'static str, id: &str) -> AppError {
    AppError::from(StorageError::NotFound {
        entity,
        id: id.to_string(),
    })
}
