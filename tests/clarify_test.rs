//! Integration tests for multi-round clarification
//!
//! Drives the clarify engine with scripted agent replies over an
//! in-memory store.

mod common;

use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::{pipeline, FnEmbedder, Reply, ScriptedChat};
use taskwing::clarify::{ClarifyRequest, REVIEW_QUESTION, SKIPPED_ANSWER};
use taskwing::events::{MemorySink, NullSink, StreamEvent};
use taskwing::storage::Storage;
use taskwing::ErrorKind;

fn proposal(enriched: &str, questions: &[&str], ready: bool) -> Reply {
    Reply::json(json!({
        "enriched_goal": enriched,
        "goal_summary": enriched,
        "questions": questions,
        "is_ready_to_plan": ready
    }))
}

fn embedder() -> std::sync::Arc<FnEmbedder> {
    FnEmbedder::constant(vec![1.0, 0.0])
}

#[cfg(test)]
mod round_tests {
    use super::*;

    #[tokio::test]
    async fn test_first_round_is_never_ready() {
        let chat = ScriptedChat::new(vec![proposal("Add JWT auth to the REST API", &[], true)]);
        let pipeline = pipeline(chat.clone(), embedder()).await;

        let result = pipeline
            .clarify()
            .clarify(ClarifyRequest::new("add auth"), &NullSink, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success);
        assert!(!result.is_ready_to_plan);
        assert_eq!(result.round, 1);
        assert_eq!(result.questions, vec![REVIEW_QUESTION]);
        assert_eq!(result.enriched_goal, "Add JWT auth to the REST API");
        assert_eq!(chat.calls(), 1);
    }

    #[tokio::test]
    async fn test_answers_lead_to_ready_session() {
        let chat = ScriptedChat::new(vec![
            proposal("Add auth", &["Which token format?", "Session length?"], false),
            proposal("Add JWT auth with 1h sessions", &[], true),
        ]);
        let pipeline = pipeline(chat.clone(), embedder()).await;
        let cancel = CancellationToken::new();

        let first = pipeline
            .clarify()
            .clarify(ClarifyRequest::new("add auth"), &NullSink, &cancel)
            .await
            .unwrap();
        assert_eq!(first.questions.len(), 2);

        let second = pipeline
            .clarify()
            .clarify(
                ClarifyRequest::for_session(&first.clarify_session_id)
                    .with_answers(vec!["JWT".to_string(), String::new()]),
                &NullSink,
                &cancel,
            )
            .await
            .unwrap();

        assert!(second.is_ready_to_plan);
        assert!(second.questions.is_empty());
        assert_eq!(second.round, 2);
        assert_eq!(second.enriched_goal, "Add JWT auth with 1h sessions");

        let prompt = chat.last_user_message().unwrap();
        assert!(prompt.contains("A: JWT"));
        assert!(prompt.contains(SKIPPED_ANSWER));

        let session = pipeline
            .storage()
            .get_clarify_session(&first.clarify_session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.rounds[0].answers, vec!["JWT", SKIPPED_ANSWER]);
        assert_eq!(
            session.final_enriched_goal.as_deref(),
            Some("Add JWT auth with 1h sessions")
        );
    }

    #[tokio::test]
    async fn test_repeat_call_without_input_is_idempotent() {
        let chat = ScriptedChat::new(vec![proposal("Add auth", &["Which token format?"], false)]);
        let pipeline = pipeline(chat.clone(), embedder()).await;
        let cancel = CancellationToken::new();

        let first = pipeline
            .clarify()
            .clarify(ClarifyRequest::new("add auth"), &NullSink, &cancel)
            .await
            .unwrap();
        let again = pipeline
            .clarify()
            .clarify(
                ClarifyRequest::for_session(&first.clarify_session_id),
                &NullSink,
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(first, again);
        assert_eq!(chat.calls(), 1);
    }

    #[tokio::test]
    async fn test_round_limit_forces_readiness() {
        let chat = ScriptedChat::new(vec![proposal("Add auth", &["Which token format?"], false)]);
        let pipeline = pipeline(chat, embedder()).await;

        let result = pipeline
            .clarify()
            .clarify(
                ClarifyRequest::new("add auth").with_max_rounds(1),
                &NullSink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.is_ready_to_plan);
        assert!(result.questions.is_empty());
        assert!(result.message.contains("1-round limit"));
    }

    #[tokio::test]
    async fn test_auto_answer_fills_open_questions() {
        let chat = ScriptedChat::new(vec![
            proposal("Add caching", &["Which store?", "TTL?"], false),
            Reply::json(json!({ "answers": ["Redis", "5 minutes"] })),
            proposal("Add a Redis read-through cache with 5 minute TTL", &[], true),
        ]);
        let pipeline = pipeline(chat.clone(), embedder()).await;
        let cancel = CancellationToken::new();

        let first = pipeline
            .clarify()
            .clarify(ClarifyRequest::new("add caching"), &NullSink, &cancel)
            .await
            .unwrap();
        let second = pipeline
            .clarify()
            .clarify(
                ClarifyRequest::for_session(&first.clarify_session_id).with_auto_answer(),
                &NullSink,
                &cancel,
            )
            .await
            .unwrap();

        assert!(second.is_ready_to_plan);
        assert_eq!(chat.calls(), 3);

        let session = pipeline
            .storage()
            .get_clarify_session(&first.clarify_session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.rounds[0].answers, vec!["Redis", "5 minutes"]);
        assert!(session.rounds[0].auto_answered);
    }

    #[tokio::test]
    async fn test_overlapping_rounds_are_both_kept() {
        let delayed = |enriched: &str, question: &str| {
            Reply::Delayed(
                Duration::from_millis(50),
                json!({
                    "enriched_goal": enriched,
                    "goal_summary": enriched,
                    "questions": [question],
                    "is_ready_to_plan": false
                })
                .to_string(),
            )
        };
        let chat = ScriptedChat::new(vec![
            proposal("Add auth", &["Which token format?"], false),
            delayed("Add JWT auth", "Session length?"),
            delayed("Add JWT auth with 1h sessions", "Refresh tokens?"),
        ]);
        let pipeline = pipeline(chat.clone(), embedder()).await;
        let cancel = CancellationToken::new();

        let first = pipeline
            .clarify()
            .clarify(ClarifyRequest::new("add auth"), &NullSink, &cancel)
            .await
            .unwrap();
        let id = first.clarify_session_id.clone();

        let (a, b) = tokio::join!(
            pipeline.clarify().clarify(
                ClarifyRequest::for_session(&id).with_answers(vec!["JWT".to_string()]),
                &NullSink,
                &cancel,
            ),
            pipeline.clarify().clarify(
                ClarifyRequest::for_session(&id).with_answers(vec!["1h".to_string()]),
                &NullSink,
                &cancel,
            ),
        );
        assert!(a.unwrap().success);
        assert!(b.unwrap().success);

        let session = pipeline
            .storage()
            .get_clarify_session(&id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.rounds.len(), 3);
        let mut answered: Vec<String> = session.rounds[..2]
            .iter()
            .flat_map(|r| r.answers.clone())
            .collect();
        answered.sort();
        assert_eq!(answered, vec!["1h", "JWT"]);
        assert_eq!(chat.calls(), 3);
    }

    #[tokio::test]
    async fn test_empty_goal_is_user_error() {
        let pipeline = pipeline(ScriptedChat::new(vec![]), embedder()).await;
        let err = pipeline
            .clarify()
            .clarify(ClarifyRequest::new("  "), &NullSink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserError);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let pipeline = pipeline(ScriptedChat::new(vec![]), embedder()).await;
        let err = pipeline
            .clarify()
            .clarify(
                ClarifyRequest::for_session("missing"),
                &NullSink,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}

#[cfg(test)]
mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_agent_failure_keeps_previous_draft() {
        let chat = ScriptedChat::new(vec![
            proposal("Add auth", &["Which token format?"], false),
            Reply::Text("not json at all".to_string()),
            Reply::Text("still not json".to_string()),
            Reply::Text("nope".to_string()),
        ]);
        let pipeline = pipeline(chat.clone(), embedder()).await;
        let cancel = CancellationToken::new();

        let first = pipeline
            .clarify()
            .clarify(ClarifyRequest::new("add auth"), &NullSink, &cancel)
            .await
            .unwrap();

        let sink = MemorySink::new();
        let failed = pipeline
            .clarify()
            .clarify(
                ClarifyRequest::for_session(&first.clarify_session_id)
                    .with_answers(vec!["JWT".to_string()]),
                &sink,
                &cancel,
            )
            .await
            .unwrap();

        assert!(!failed.success);
        assert_eq!(failed.enriched_goal, "Add auth");
        assert_eq!(failed.round, 1);
        // One attempt plus two schema-validation retries.
        assert_eq!(chat.calls(), 4);

        let events = sink.events();
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, StreamEvent::Retry { .. }))
                .count(),
            2
        );
        assert!(matches!(events.last(), Some(StreamEvent::AgentError { .. })));
    }

    #[tokio::test]
    async fn test_agent_timeout_leaves_session_untouched() {
        let chat = ScriptedChat::new(vec![proposal("Add auth", &["Which token format?"], false)]);
        let pipeline = pipeline(chat.clone(), embedder()).await;
        let cancel = CancellationToken::new();

        let first = pipeline
            .clarify()
            .clarify(ClarifyRequest::new("add auth"), &NullSink, &cancel)
            .await
            .unwrap();

        tokio::time::pause();
        chat.push(Reply::Delayed(
            Duration::from_secs(61),
            json!({ "enriched_goal": "late" }).to_string(),
        ));

        let err = pipeline
            .clarify()
            .clarify(
                ClarifyRequest::for_session(&first.clarify_session_id)
                    .with_answers(vec!["JWT".to_string()]),
                &NullSink,
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let session = pipeline
            .storage()
            .get_clarify_session(&first.clarify_session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.rounds.len(), 1);
        assert!(session.rounds[0].answers.is_empty());
    }

    #[tokio::test]
    async fn test_auto_answer_timeout_leaves_round_count() {
        let chat = ScriptedChat::new(vec![proposal(
            "Add caching",
            &["Which store?", "TTL?"],
            false,
        )]);
        let pipeline = pipeline(chat.clone(), embedder()).await;
        let cancel = CancellationToken::new();

        let first = pipeline
            .clarify()
            .clarify(ClarifyRequest::new("add caching"), &NullSink, &cancel)
            .await
            .unwrap();

        tokio::time::pause();
        chat.push(Reply::Delayed(
            Duration::from_secs(61),
            json!({ "answers": ["Redis", "5 minutes"] }).to_string(),
        ));

        let err = pipeline
            .clarify()
            .clarify(
                ClarifyRequest::for_session(&first.clarify_session_id).with_auto_answer(),
                &NullSink,
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        // Only the auto-answer call was made; the clarify agent never ran.
        assert_eq!(chat.calls(), 2);

        let session = pipeline
            .storage()
            .get_clarify_session(&first.clarify_session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.rounds.len(), 1);
        assert!(session.rounds[0].answers.is_empty());
        assert!(!session.rounds[0].auto_answered);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let chat = ScriptedChat::new(vec![proposal("Add auth", &[], false)]);
        let pipeline = pipeline(chat.clone(), embedder()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline
            .clarify()
            .clarify(ClarifyRequest::new("add auth"), &NullSink, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(chat.calls(), 0);
    }
}
