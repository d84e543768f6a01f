//! Integration tests for context retrieval
//!
//! Seeds an in-memory store with hand-made vectors and checks ranking,
//! graph expansion, reranking and architecture injection.

mod common;

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use common::{memory_storage, pipeline, test_config, FnEmbedder, Reply, ScriptedChat};
use taskwing::error::{LlmError, LlmResult};
use taskwing::llm::{Gateway, RerankHit, Reranker};
use taskwing::retrieval::{ARCHITECTURE_AGENT, NO_RELEVANT_MEMORY};
use taskwing::storage::{relation, Edge, Node, NodeType, Storage};
use taskwing::{ErrorKind, Pipeline};

/// Unit vector in the x/y plane with the given cosine to [1, 0, 0].
fn at_cosine(cos: f32) -> Vec<f32> {
    vec![cos, (1.0 - cos * cos).sqrt(), 0.0]
}

fn query_embedder() -> Arc<FnEmbedder> {
    FnEmbedder::constant(vec![1.0, 0.0, 0.0])
}

/// Reranker returning fixed scores by candidate position.
struct FixedReranker(Vec<f32>);

#[async_trait]
impl Reranker for FixedReranker {
    async fn rerank(&self, _query: &str, texts: &[String]) -> LlmResult<Vec<RerankHit>> {
        Ok(self
            .0
            .iter()
            .take(texts.len())
            .enumerate()
            .map(|(index, score)| RerankHit {
                index,
                score: *score,
                text: None,
            })
            .collect())
    }
}

struct FailingReranker;

#[async_trait]
impl Reranker for FailingReranker {
    async fn rerank(&self, _query: &str, _texts: &[String]) -> LlmResult<Vec<RerankHit>> {
        Err(LlmError::Upstream {
            status: 502,
            body: "bad gateway".to_string(),
        })
    }
}

async fn with_reranker(reranker: Arc<dyn Reranker>) -> Pipeline {
    let gateway = Gateway::new(ScriptedChat::new(vec![]), query_embedder()).with_reranker(reranker);
    Pipeline::new(test_config(), memory_storage().await, gateway)
}

fn assert_close(actual: f32, expected: f32) {
    assert!(
        (actual - expected).abs() < 1e-3,
        "expected {} but got {}",
        expected,
        actual
    );
}

#[cfg(test)]
mod ranking_tests {
    use super::*;

    #[tokio::test]
    async fn test_expansion_interleaves_discounted_neighbors() {
        let pipeline = pipeline(ScriptedChat::new(vec![]), query_embedder()).await;
        let storage = pipeline.storage();

        let n1 = Node::new(NodeType::Decision, "JWT auth", "Tokens signed with HS256")
            .with_embedding(at_cosine(0.81));
        let n2 = Node::new(NodeType::Pattern, "Repository pattern", "")
            .with_embedding(at_cosine(0.42));
        let n3 = Node::new(NodeType::Constraint, "Tokens expire after 1h", "");
        storage.create_node(&n1).await.unwrap();
        storage.create_node(&n2).await.unwrap();
        storage.create_node(&n3).await.unwrap();
        storage
            .create_edge(&Edge::new(&n1.id, &n3.id, relation::RELATES_TO))
            .await
            .unwrap();

        let ctx = pipeline
            .retrieval()
            .retrieve("how do we authenticate?", &CancellationToken::new())
            .await
            .unwrap();

        let ids: Vec<&str> = ctx.scored_nodes.iter().map(|s| s.node.id.as_str()).collect();
        assert_eq!(ids, vec![n1.id.as_str(), n3.id.as_str(), n2.id.as_str()]);
        assert_close(ctx.scored_nodes[0].score, 0.81);
        assert_close(ctx.scored_nodes[1].score, 0.486);
        assert_close(ctx.scored_nodes[2].score, 0.42);
        assert_eq!(ctx.scored_nodes[1].expanded_from.as_deref(), Some(n1.id.as_str()));
        assert!(ctx.strategy.contains("graph expansion (+1)"));
        assert!(ctx.context_text.contains("JWT auth"));
    }

    #[tokio::test]
    async fn test_unreranked_results_are_not_capped_by_rerank_k() {
        let pipeline = pipeline(ScriptedChat::new(vec![]), query_embedder()).await;
        for i in 0..7 {
            let node = Node::new(NodeType::Feature, format!("feature {}", i), "")
                .with_embedding(at_cosine(0.9 - i as f32 * 0.1));
            pipeline.storage().create_node(&node).await.unwrap();
        }

        let ctx = pipeline
            .retrieval()
            .retrieve("features", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ctx.scored_nodes.len(), 7);
        assert!(ctx
            .scored_nodes
            .windows(2)
            .all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_empty_store_reports_no_relevant_memory() {
        let embedder = query_embedder();
        let pipeline = pipeline(ScriptedChat::new(vec![]), embedder.clone()).await;

        let ctx = pipeline
            .retrieval()
            .retrieve("anything", &CancellationToken::new())
            .await
            .unwrap();

        assert!(ctx.is_empty());
        assert_eq!(ctx.strategy, NO_RELEVANT_MEMORY);
        assert!(ctx.context_text.is_empty());
        assert_eq!(embedder.calls(), 0);
    }

    #[tokio::test]
    async fn test_blank_query_is_user_error() {
        let pipeline = pipeline(ScriptedChat::new(vec![]), query_embedder()).await;
        let err = pipeline
            .retrieval()
            .retrieve("   ", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserError);
    }

    #[tokio::test]
    async fn test_architecture_overview_is_pinned_first() {
        let pipeline = pipeline(ScriptedChat::new(vec![]), query_embedder()).await;
        let storage = pipeline.storage();

        storage
            .create_node(
                &Node::new(NodeType::Feature, "Search", "").with_embedding(at_cosine(0.9)),
            )
            .await
            .unwrap();
        let overview = Node::new(NodeType::Metadata, "Architecture overview", "Layers: api, core")
            .with_source_agent(ARCHITECTURE_AGENT);
        storage.create_node(&overview).await.unwrap();

        let ctx = pipeline
            .retrieval()
            .retrieve("search", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ctx.scored_nodes[0].node.id, overview.id);
        assert!(ctx.scored_nodes[0].score >= ctx.scored_nodes[1].score);
        assert!(ctx.strategy.contains("architecture overview"));
    }

    #[tokio::test]
    async fn test_query_rewrite_feeds_the_embedder() {
        let chat = ScriptedChat::new(vec![Reply::Text("\"authentication flow\"\n".to_string())]);
        let embedder = FnEmbedder::new(|text| {
            if text == "authentication flow" {
                vec![1.0, 0.0, 0.0]
            } else {
                vec![0.0, 0.0, 1.0]
            }
        });
        let mut config = test_config();
        config.retrieval.rewrite_queries = true;
        let pipeline = common::pipeline_with(config, chat.clone(), embedder).await;

        let node = Node::new(NodeType::Decision, "Sessions", "").with_embedding(vec![1.0, 0.0, 0.0]);
        pipeline.storage().create_node(&node).await.unwrap();

        let ctx = pipeline
            .retrieval()
            .retrieve("how do users log in?", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(chat.calls(), 1);
        let request = chat.last_request().unwrap();
        assert_eq!(request.temperature, Some(0.0));
        assert!(request.max_tokens.is_some());
        assert!(ctx.strategy.contains("query rewritten"));
        assert_close(ctx.scored_nodes[0].score, 1.0);
    }

    #[tokio::test]
    async fn test_failed_rewrite_falls_back_to_raw_query() {
        let chat = ScriptedChat::new(vec![Reply::Status(500)]);
        let mut config = test_config();
        config.retrieval.rewrite_queries = true;
        let pipeline = common::pipeline_with(config, chat, query_embedder()).await;

        let node = Node::new(NodeType::Decision, "d", "").with_embedding(vec![1.0, 0.0, 0.0]);
        pipeline.storage().create_node(&node).await.unwrap();

        let ctx = pipeline
            .retrieval()
            .retrieve("q", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ctx.scored_nodes.len(), 1);
        assert!(!ctx.strategy.contains("query rewritten"));
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_retrieval() {
        let pipeline = pipeline(ScriptedChat::new(vec![]), query_embedder()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline.retrieval().retrieve("q", &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}

#[cfg(test)]
mod rerank_tests {
    use super::*;

    async fn seed(pipeline: &Pipeline) -> (Node, Node) {
        let high = Node::new(NodeType::Feature, "high cosine", "").with_embedding(at_cosine(0.9));
        let low = Node::new(NodeType::Feature, "low cosine", "").with_embedding(at_cosine(0.3));
        pipeline.storage().create_node(&high).await.unwrap();
        pipeline.storage().create_node(&low).await.unwrap();
        (high, low)
    }

    #[tokio::test]
    async fn test_reranker_scores_replace_cosine() {
        // Candidates arrive in vector order: high first, low second.
        let pipeline = with_reranker(Arc::new(FixedReranker(vec![0.1, 0.95]))).await;
        let (high, low) = seed(&pipeline).await;

        let ctx = pipeline
            .retrieval()
            .retrieve("q", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ctx.scored_nodes[0].node.id, low.id);
        assert_close(ctx.scored_nodes[0].score, 0.95);
        assert_eq!(ctx.scored_nodes[1].node.id, high.id);
        assert!(ctx.strategy.contains("reranked"));
    }

    #[tokio::test]
    async fn test_reranked_results_keep_rerank_k() {
        let pipeline =
            with_reranker(Arc::new(FixedReranker(vec![0.9, 0.8, 0.7, 0.6, 0.5, 0.4, 0.3]))).await;
        for i in 0..7 {
            let node = Node::new(NodeType::Feature, format!("feature {}", i), "")
                .with_embedding(at_cosine(0.9 - i as f32 * 0.1));
            pipeline.storage().create_node(&node).await.unwrap();
        }

        let ctx = pipeline
            .retrieval()
            .retrieve("features", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ctx.scored_nodes.len(), test_config().retrieval.rerank_top_k);
        assert!(ctx.strategy.contains("reranked (kept 5)"));
    }

    #[tokio::test]
    async fn test_reranker_failure_keeps_vector_order() {
        let pipeline = with_reranker(Arc::new(FailingReranker)).await;
        let (high, _) = seed(&pipeline).await;

        let ctx = pipeline
            .retrieval()
            .retrieve("q", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ctx.scored_nodes[0].node.id, high.id);
        assert_close(ctx.scored_nodes[0].score, 0.9);
        assert!(!ctx.strategy.contains("reranked"));
    }
}
