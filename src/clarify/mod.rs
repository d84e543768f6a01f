//! Multi-round goal clarification.
//!
//! Each call runs at most one clarification round against a persisted
//! [`ClarifySession`]. A session is ready to plan once the agent says so
//! after at least one reviewed round, or unconditionally at `max_rounds`.

mod locks;

pub use locks::{SessionGuard, SessionLocks};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::{AgentInput, AgentRuntime, AutoAnswerAgent, ClarifyAgent, ClarifyProposal};
use crate::cancel::cancellable;
use crate::error::{AppError, AppResult, ErrorKind, StorageError};
use crate::events::EventSink;
use crate::retrieval::RetrievalService;
use crate::storage::{ClarifyRound, ClarifySession, SqliteStorage, Storage};

/// Maximum length of a goal summary, in characters.
pub const MAX_SUMMARY_CHARS: usize = 100;

/// Maximum questions kept from a single round.
pub const MAX_QUESTIONS: usize = 5;

/// Recorded in place of an empty answer.
pub const SKIPPED_ANSWER: &str = "(skipped)";

/// Asked when the agent has nothing to ask but a review pass is still required.
pub const REVIEW_QUESTION: &str =
    "Does this specification capture what you want? Reply with corrections, or leave blank to accept.";

/// Truncate to at most [`MAX_SUMMARY_CHARS`] characters, ending with an ellipsis when cut.
pub fn truncate_summary(text: &str) -> String {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    if line.chars().count() <= MAX_SUMMARY_CHARS {
        return line.to_string();
    }
    let mut out: String = line.chars().take(MAX_SUMMARY_CHARS - 1).collect();
    out.push('…');
    out
}

/// Input to a clarification call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClarifyRequest {
    #[serde(default)]
    pub goal: String,
    #[serde(default, alias = "clarifySessionId", alias = "clarify_session_id")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub answers: Option<Vec<String>>,
    #[serde(default, alias = "autoAnswer")]
    pub auto_answer: bool,
    #[serde(default, alias = "maxRounds")]
    pub max_rounds: Option<u32>,
}

impl ClarifyRequest {
    /// Start a new session for `goal`
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            ..Default::default()
        }
    }

    /// Continue an existing session
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    /// Supply answers to the previous round's questions
    pub fn with_answers(mut self, answers: Vec<String>) -> Self {
        self.answers = Some(answers);
        self
    }

    /// Let the model answer outstanding questions
    pub fn with_auto_answer(mut self) -> Self {
        self.auto_answer = true;
        self
    }

    /// Set the round limit for a new session
    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = Some(max_rounds);
        self
    }
}

/// Outcome of a clarification call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarifyResult {
    pub success: bool,
    pub message: String,
    pub clarify_session_id: String,
    pub enriched_goal: String,
    pub goal_summary: String,
    pub questions: Vec<String>,
    pub is_ready_to_plan: bool,
    /// Rounds completed so far.
    pub round: usize,
    pub max_rounds: u32,
}

impl ClarifyResult {
    /// Result describing the session's current state
    pub fn from_session(session: &ClarifySession) -> Self {
        let last = session.last_round();
        let round = session.rounds.len();
        let forced = session.is_ready_to_plan && !last.map(|r| r.verdict).unwrap_or(false);

        let message = if !session.is_ready_to_plan {
            format!(
                "Round {}/{}: answer the questions to refine the goal",
                round, session.max_rounds
            )
        } else if forced {
            format!(
                "Reached the {}-round limit; proceeding with the latest draft",
                session.max_rounds
            )
        } else {
            "Goal is ready to plan".to_string()
        };

        Self {
            success: true,
            message,
            clarify_session_id: session.id.clone(),
            enriched_goal: session.current_enriched_goal().to_string(),
            goal_summary: session.goal_summary.clone(),
            questions: if session.is_ready_to_plan {
                Vec::new()
            } else {
                last.map(|r| r.questions.clone()).unwrap_or_default()
            },
            is_ready_to_plan: session.is_ready_to_plan,
            round,
            max_rounds: session.max_rounds,
        }
    }

    fn failed(session: &ClarifySession, error: &AppError) -> Self {
        Self {
            success: false,
            message: format!("Clarification round failed: {}", error.user_message()),
            ..Self::from_session(session)
        }
    }
}

/// Runs clarification rounds and persists session state.
#[derive(Clone)]
pub struct ClarifyEngine {
    storage: SqliteStorage,
    runtime: AgentRuntime,
    retrieval: RetrievalService,
    locks: SessionLocks,
    default_max_rounds: u32,
}

impl ClarifyEngine {
    pub fn new(
        storage: SqliteStorage,
        runtime: AgentRuntime,
        retrieval: RetrievalService,
        default_max_rounds: u32,
    ) -> Self {
        Self {
            storage,
            runtime,
            retrieval,
            locks: SessionLocks::new(),
            default_max_rounds: default_max_rounds.max(1),
        }
    }

    /// Share session locks with other services that change sessions
    pub fn with_session_locks(mut self, locks: SessionLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Run one clarification call.
    ///
    /// Timeouts, cancellation and configuration errors are returned as
    /// `Err` and leave the session untouched; any other agent failure
    /// yields the previous draft with `success = false`.
    pub async fn clarify(
        &self,
        request: ClarifyRequest,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> AppResult<ClarifyResult> {
        // Held until the round is saved.
        let (_guard, mut session) = match &request.session_id {
            Some(id) => {
                let guard = self.locks.acquire(id, cancel).await?;
                (Some(guard), self.load(id, cancel).await?)
            }
            None => (None, self.start(&request, cancel).await?),
        };

        if session.plan_id.is_some() {
            return Err(AppError::user(format!(
                "clarify session {} already produced a plan",
                session.id
            )));
        }

        let has_answers = request.answers.is_some();
        if !session.rounds.is_empty() && !has_answers && !request.auto_answer {
            debug!(session_id = %session.id, "No new input, returning previous round");
            return Ok(ClarifyResult::from_session(&session));
        }

        if session.rounds.len() >= session.max_rounds as usize {
            if !session.is_ready_to_plan {
                self.force_ready(&mut session);
                self.save(&session, cancel).await?;
            }
            return Ok(ClarifyResult::from_session(&session));
        }

        if let Some(answers) = &request.answers {
            fold_answers(&mut session, answers, false);
        }

        if request.auto_answer {
            match self.auto_answer(&session, sink, cancel).await {
                Ok(Some(answers)) => fold_answers(&mut session, &answers, true),
                Ok(None) => {}
                Err(e) if propagates(&e) => return Err(e),
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Auto-answer failed");
                    return Ok(ClarifyResult::failed(&session, &e));
                }
            }
        }

        let input = self.round_input(&session);
        let proposal = match self.runtime.run(&ClarifyAgent, &input, sink, cancel).await {
            Ok(output) => output.result,
            Err(e) if propagates(&e) => return Err(e),
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Clarify round failed");
                return Ok(ClarifyResult::failed(&session, &e));
            }
        };

        self.apply_proposal(&mut session, proposal);
        self.save(&session, cancel).await?;

        info!(
            session_id = %session.id,
            round = session.rounds.len(),
            ready = session.is_ready_to_plan,
            "Clarify round completed"
        );
        Ok(ClarifyResult::from_session(&session))
    }

    /// Fetch a session
    pub async fn session(&self, id: &str, cancel: &CancellationToken) -> AppResult<ClarifySession> {
        self.load(id, cancel).await
    }

    async fn load(&self, id: &str, cancel: &CancellationToken) -> AppResult<ClarifySession> {
        cancellable(cancel, self.storage.get_clarify_session(id))
            .await?
            .ok_or_else(|| {
                AppError::from(StorageError::NotFound {
                    entity: "clarify session",
                    id: id.to_string(),
                })
            })
    }

    async fn save(&self, session: &ClarifySession, cancel: &CancellationToken) -> AppResult<()> {
        cancellable(cancel, self.storage.save_clarify_session(session)).await
    }

    async fn start(
        &self,
        request: &ClarifyRequest,
        cancel: &CancellationToken,
    ) -> AppResult<ClarifySession> {
        let goal = request.goal.trim();
        if goal.is_empty() {
            return Err(AppError::user("goal must not be empty"));
        }

        let context = self.retrieval.retrieve(goal, cancel).await?;
        let max_rounds = request.max_rounds.unwrap_or(self.default_max_rounds);
        let session = ClarifySession::new(goal, context.context_text, max_rounds);
        self.save(&session, cancel).await?;

        info!(
            session_id = %session.id,
            max_rounds = session.max_rounds,
            context_nodes = context.scored_nodes.len(),
            "Clarify session created"
        );
        Ok(session)
    }

    /// Ask the model to answer the last round's unanswered questions.
    async fn auto_answer(
        &self,
        session: &ClarifySession,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> AppResult<Option<Vec<String>>> {
        let Some(last) = session.last_round() else {
            return Ok(None);
        };
        let open: Vec<(usize, &String)> = last
            .questions
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                last.answers
                    .get(*i)
                    .map(|a| a.is_empty() || a == SKIPPED_ANSWER)
                    .unwrap_or(true)
            })
            .collect();
        if open.is_empty() {
            return Ok(None);
        }

        let mut questions = String::new();
        for (n, (_, q)) in open.iter().enumerate() {
            let _ = writeln!(questions, "{}. {}", n + 1, q);
        }
        let input = AgentInput::new(&session.goal)
            .with_enriched_goal(&last.draft_enriched_goal)
            .with_context(&session.context)
            .with_section("Questions", questions);

        let output = self.runtime.run(&AutoAnswerAgent, &input, sink, cancel).await?;

        let mut merged = last.answers.clone();
        merged.resize(last.questions.len(), String::new());
        for ((index, _), answer) in open.iter().zip(output.result.answers) {
            merged[*index] = answer;
        }
        Ok(Some(merged))
    }

    fn round_input(&self, session: &ClarifySession) -> AgentInput {
        let mut history = String::new();
        for (n, round) in session.rounds.iter().enumerate() {
            let _ = writeln!(history, "### Round {}", n + 1);
            let _ = writeln!(history, "Draft: {}", round.draft_enriched_goal.trim());
            for (i, question) in round.questions.iter().enumerate() {
                let answer = round.answers.get(i).map(String::as_str).unwrap_or("(unanswered)");
                let _ = writeln!(history, "Q: {}\nA: {}", question, answer);
            }
        }

        let mut input = AgentInput::new(&session.goal).with_context(&session.context);
        if !history.is_empty() {
            input = input.with_section("Clarification history", history);
        }
        input.with_section(
            "Round",
            format!("{} of {}", session.rounds.len() + 1, session.max_rounds),
        )
    }

    fn apply_proposal(&self, session: &mut ClarifySession, proposal: ClarifyProposal) {
        let reviewed = !session.rounds.is_empty();
        let round_number = session.rounds.len() + 1;
        let forced = round_number >= session.max_rounds as usize;
        let ready = (proposal.is_ready_to_plan && reviewed) || forced;

        let enriched_goal = proposal.enriched_goal.trim().to_string();
        let summary_source = if proposal.goal_summary.trim().is_empty() {
            &enriched_goal
        } else {
            &proposal.goal_summary
        };
        let goal_summary = truncate_summary(summary_source);

        let mut questions: Vec<String> = proposal
            .questions
            .iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .take(MAX_QUESTIONS)
            .collect();
        if !ready && questions.is_empty() {
            questions.push(REVIEW_QUESTION.to_string());
        }

        session.rounds.push(ClarifyRound {
            draft_enriched_goal: enriched_goal.clone(),
            goal_summary: goal_summary.clone(),
            questions,
            answers: Vec::new(),
            auto_answered: false,
            verdict: proposal.is_ready_to_plan && reviewed,
        });
        session.goal_summary = goal_summary;
        session.is_ready_to_plan = ready;
        session.final_enriched_goal = ready.then_some(enriched_goal);
        session.updated_at = Utc::now();
    }

    fn force_ready(&self, session: &mut ClarifySession) {
        session.is_ready_to_plan = true;
        session.final_enriched_goal = Some(session.current_enriched_goal().to_string());
        session.updated_at = Utc::now();
    }
}

/// Errors that abort the call instead of degrading to `success = false`.
fn propagates(error: &AppError) -> bool {
    matches!(
        error.kind(),
        ErrorKind::Timeout | ErrorKind::Cancelled | ErrorKind::ConfigError
    )
}

/// Attach answers to the last round's questions; empty answers become "(skipped)".
fn fold_answers(session: &mut ClarifySession, answers: &[String], auto: bool) {
    let Some(last) = session.rounds.last_mut() else {
        debug!(session_id = %session.id, "Answers supplied before any questions; ignoring");
        return;
    };
    last.answers = last
        .questions
        .iter()
        .enumerate()
        .map(|(i, _)| {
            answers
                .get(i)
                .map(|a| a.trim())
                .filter(|a| !a.is_empty())
                .unwrap_or(SKIPPED_ANSWER)
                .to_string()
        })
        .collect();
    last.auto_answered = auto;
    session.updated_at = Utc::now();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round(questions: &[&str]) -> ClarifyRound {
        ClarifyRound {
            draft_enriched_goal: "draft".into(),
            goal_summary: "draft".into(),
            questions: questions.iter().map(|q| q.to_string()).collect(),
            answers: vec![],
            auto_answered: false,
            verdict: false,
        }
    }

    #[test]
    fn test_truncate_summary_short_is_unchanged() {
        assert_eq!(truncate_summary("Add OAuth login"), "Add OAuth login");
    }

    #[test]
    fn test_truncate_summary_cuts_at_char_boundary() {
        let long = "é".repeat(150);
        let summary = truncate_summary(&long);
        assert_eq!(summary.chars().count(), MAX_SUMMARY_CHARS);
        assert!(summary.ends_with('…'));
    }

    #[test]
    fn test_truncate_summary_uses_first_line() {
        assert_eq!(truncate_summary("\n  First line\nsecond"), "First line");
    }

    #[test]
    fn test_fold_answers_marks_skipped() {
        let mut session = ClarifySession::new("goal", "", 3);
        session.rounds.push(round(&["a?", "b?", "c?"]));
        fold_answers(&mut session, &["yes".to_string(), "  ".to_string()], false);
        assert_eq!(
            session.rounds[0].answers,
            vec!["yes", SKIPPED_ANSWER, SKIPPED_ANSWER]
        );
    }

    #[test]
    fn test_fold_answers_without_rounds_is_ignored() {
        let mut session = ClarifySession::new("goal", "", 3);
        fold_answers(&mut session, &["yes".to_string()], true);
        assert!(session.rounds.is_empty());
    }

    #[test]
    fn test_result_from_open_session() {
        let mut session = ClarifySession::new("goal", "", 3);
        session.rounds.push(round(&["which db?"]));
        session.goal_summary = "draft".into();
        let result = ClarifyResult::from_session(&session);
        assert!(result.success);
        assert!(!result.is_ready_to_plan);
        assert_eq!(result.questions, vec!["which db?"]);
        assert_eq!(result.round, 1);
        assert_eq!(result.enriched_goal, "draft");
    }

    #[test]
    fn test_result_from_forced_session() {
        let mut session = ClarifySession::new("goal", "", 1);
        session.rounds.push(round(&["which db?"]));
        session.is_ready_to_plan = true;
        session.final_enriched_goal = Some("draft".into());
        let result = ClarifyResult::from_session(&session);
        assert!(result.is_ready_to_plan);
        assert!(result.questions.is_empty());
        assert!(result.message.contains("1-round limit"));
    }

    #[test]
    fn test_request_accepts_camel_case() {
        let request: ClarifyRequest = serde_json::from_str(
            r#"{"goal":"g","clarifySessionId":"s1","autoAnswer":true,"maxRounds":3}"#,
        )
        .unwrap();
        assert_eq!(request.session_id.as_deref(), Some("s1"));
        assert!(request.auto_answer);
        assert_eq!(request.max_rounds, Some(3));
    }
}
