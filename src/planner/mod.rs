//! Plan generation from an enriched goal.
//!
//! Retrieves fresh context, runs the planning agent, validates the proposed
//! tasks and persists the plan and its tasks in one transaction.

mod validate;

pub use validate::{validate_proposals, ValidationReport, MAX_PRIORITY, MIN_PRIORITY};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agents::{AgentInput, AgentRuntime, PlanningAgent};
use crate::cancel::cancellable;
use crate::clarify::SessionLocks;
use crate::error::{AppError, AppResult, ErrorKind, StorageError};
use crate::events::EventSink;
use crate::retrieval::{KgContext, RetrievalService};
use crate::storage::{ActivityEntry, Plan, SqliteStorage, Storage, Task};

/// Input to plan generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Session whose enriched goal is planned.
    #[serde(default, alias = "clarifySessionId", alias = "session_id")]
    pub clarify_session_id: Option<String>,
    /// Goal used when no session is given.
    #[serde(default)]
    pub goal: Option<String>,
    /// Enriched goal used when no session is given; defaults to `goal`.
    #[serde(default, alias = "enrichedGoal")]
    pub enriched_goal: Option<String>,
    /// Plan even if the session is not ready.
    #[serde(default, alias = "bypassReadiness")]
    pub bypass_readiness: bool,
}

impl GenerateRequest {
    /// Plan from a clarify session
    pub fn from_session(session_id: impl Into<String>) -> Self {
        Self {
            clarify_session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    /// Plan directly from a goal
    pub fn from_goal(goal: impl Into<String>) -> Self {
        Self {
            goal: Some(goal.into()),
            ..Default::default()
        }
    }

    /// Skip the readiness check
    pub fn bypassing_readiness(mut self) -> Self {
        self.bypass_readiness = true;
        self
    }
}

/// Outcome of plan generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerateResult {
    pub success: bool,
    pub plan_id: Option<String>,
    pub tasks: Vec<Task>,
    pub semantic_warnings: Vec<String>,
    pub semantic_errors: Vec<String>,
    pub message: String,
}

impl GenerateResult {
    fn failed(message: String) -> Self {
        Self {
            success: false,
            plan_id: None,
            tasks: Vec::new(),
            semantic_warnings: Vec::new(),
            semantic_errors: Vec::new(),
            message,
        }
    }
}

struct PlanTarget {
    goal: String,
    enriched_goal: String,
    goal_summary: Option<String>,
    session_id: Option<String>,
}

/// Generates and persists plans.
#[derive(Clone)]
pub struct PlanGenerator {
    storage: SqliteStorage,
    runtime: AgentRuntime,
    retrieval: RetrievalService,
    locks: SessionLocks,
    plan_top_k: usize,
}

impl PlanGenerator {
    pub fn new(
        storage: SqliteStorage,
        runtime: AgentRuntime,
        retrieval: RetrievalService,
        plan_top_k: usize,
    ) -> Self {
        Self {
            storage,
            runtime,
            retrieval,
            locks: SessionLocks::new(),
            plan_top_k,
        }
    }

    /// Share session locks with the clarify engine
    pub fn with_session_locks(mut self, locks: SessionLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Generate a plan.
    ///
    /// Semantic problems are reported alongside success. Agent failure
    /// yields `success = false`; storage failure rolls back and is
    /// returned as `Err`.
    pub async fn generate(
        &self,
        request: GenerateRequest,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> AppResult<GenerateResult> {
        // A session is planned at most once; hold it until the plan is stored.
        let _guard = match &request.clarify_session_id {
            Some(id) => Some(self.locks.acquire(id, cancel).await?),
            None => None,
        };
        let target = self.resolve_target(&request, cancel).await?;
        let mut warnings = Vec::new();

        let context = self.context_for(&target.enriched_goal, &mut warnings, cancel).await?;

        let input = AgentInput::new(&target.goal)
            .with_enriched_goal(&target.enriched_goal)
            .with_context(&context.context_text);
        let output = match self.runtime.run(&PlanningAgent, &input, sink, cancel).await {
            Ok(output) => output,
            Err(e) if aborts(&e) => return Err(e),
            Err(e) => {
                warn!(error = %e, "Planning agent failed");
                return Ok(GenerateResult::failed(format!(
                    "Planning failed: {}",
                    e.user_message()
                )));
            }
        };
        if let Some(warning) = output.warning {
            warnings.push(warning);
        }

        let plan = Plan::new(&target.goal, &target.enriched_goal)
            .with_summary(target.goal_summary.as_deref().unwrap_or(&target.enriched_goal));
        let (tasks, report) = validate_proposals(&plan.id, output.result.tasks);
        warnings.extend(report.warnings);

        match &target.session_id {
            Some(session_id) => {
                cancellable(
                    cancel,
                    self.storage.create_session_plan(session_id, &plan, &tasks),
                )
                .await?
            }
            None => cancellable(cancel, self.storage.create_plan_with_tasks(&plan, &tasks)).await?,
        }

        let entry = ActivityEntry::new("plan", format!("Created plan: {}", plan.goal_summary))
            .with_detail(serde_json::json!({ "plan_id": plan.id, "tasks": tasks.len() }));
        if let Err(e) = self.storage.log_activity(&entry).await {
            warn!(error = %e, "Failed to log plan activity");
        }

        info!(
            plan_id = %plan.id,
            tasks = tasks.len(),
            warnings = warnings.len(),
            errors = report.errors.len(),
            "Plan generated"
        );

        Ok(GenerateResult {
            success: true,
            message: format!("Created plan with {} tasks", tasks.len()),
            plan_id: Some(plan.id),
            tasks,
            semantic_warnings: warnings,
            semantic_errors: report.errors,
        })
    }

    async fn resolve_target(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> AppResult<PlanTarget> {
        if let Some(id) = &request.clarify_session_id {
            let session = cancellable(cancel, self.storage.get_clarify_session(id))
                .await?
                .ok_or_else(|| {
                    AppError::from(StorageError::NotFound {
                        entity: "clarify session",
                        id: id.clone(),
                    })
                })?;

            if let Some(plan_id) = &session.plan_id {
                return Err(AppError::user(format!(
                    "clarify session {} already produced plan {}",
                    id, plan_id
                )));
            }
            if !session.is_ready_to_plan && !request.bypass_readiness {
                return Err(AppError::user(format!(
                    "clarify session {} is not ready to plan; answer the open questions or bypass the check",
                    id
                )));
            }

            return Ok(PlanTarget {
                goal: session.goal.clone(),
                enriched_goal: session.current_enriched_goal().to_string(),
                goal_summary: Some(session.goal_summary.clone()).filter(|s| !s.is_empty()),
                session_id: Some(session.id),
            });
        }

        let goal = request
            .goal
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .ok_or_else(|| AppError::user("either clarify_session_id or goal is required"))?;
        let enriched_goal = request
            .enriched_goal
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .unwrap_or(goal);

        Ok(PlanTarget {
            goal: goal.to_string(),
            enriched_goal: enriched_goal.to_string(),
            goal_summary: None,
            session_id: None,
        })
    }

    /// Context for the planning prompt; non-fatal retrieval failures become a warning.
    async fn context_for(
        &self,
        enriched_goal: &str,
        warnings: &mut Vec<String>,
        cancel: &CancellationToken,
    ) -> AppResult<KgContext> {
        let options = self
            .retrieval
            .options()
            .with_top_k(self.plan_top_k)
            .with_rewrite(false);
        match self.retrieval.retrieve_with(enriched_goal, &options, cancel).await {
            Ok(context) => Ok(context),
            Err(e) if aborts(&e) => Err(e),
            Err(e) => {
                warn!(error = %e, "Context retrieval failed; planning without project knowledge");
                warnings.push(format!("Context retrieval failed: {}", e.user_message()));
                Ok(KgContext::empty())
            }
        }
    }
}

fn aborts(error: &AppError) -> bool {
    matches!(
        error.kind(),
        ErrorKind::Timeout | ErrorKind::Cancelled | ErrorKind::ConfigError
    )
}
