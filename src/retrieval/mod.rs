//! Context retrieval for prompt grounding.
//!
//! Composes query rewriting, vector search, optional reranking, one-hop
//! graph expansion and architecture-overview injection into a ranked
//! [`KgContext`]. Everything after the embedding step degrades gracefully.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancel::{cancellable, with_deadline};
use crate::config::RetrievalConfig;
use crate::error::{AppError, AppResult};
use crate::llm::{ChatRequest, Gateway, Message};
use crate::prompts::QUERY_REWRITE_PROMPT;
use crate::storage::{Node, NodeType, SqliteStorage, Storage};

/// Strategy reported when nothing relevant was found.
pub const NO_RELEVANT_MEMORY: &str = "no relevant memory";

/// Source tag of the architecture overview node.
pub const ARCHITECTURE_AGENT: &str = "architecture";

/// Maximum characters of node content rendered into the context text.
const MAX_CONTENT_CHARS: usize = 1500;

/// A rewritten query is one line.
const REWRITE_MAX_TOKENS: u32 = 96;

/// A node with its relevance score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredNode {
    #[serde(flatten)]
    pub node: Node,
    pub score: f32,
    /// Parent node id when the node was added by graph expansion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expanded_from: Option<String>,
}

/// Retrieval-composed context bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KgContext {
    pub context_text: String,
    pub scored_nodes: Vec<ScoredNode>,
    /// Which retrieval steps fired, for display.
    pub strategy: String,
}

impl KgContext {
    /// Empty bundle for queries with no matching knowledge
    pub fn empty() -> Self {
        Self {
            context_text: String::new(),
            scored_nodes: Vec::new(),
            strategy: NO_RELEVANT_MEMORY.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scored_nodes.is_empty()
    }
}

/// Per-call retrieval knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalOptions {
    /// Vector-search candidates (K₁).
    pub top_k: usize,
    /// Candidates kept after reranking (K₂).
    pub rerank_top_k: usize,
    /// Unseen neighbors added per surviving node.
    pub expand_per_node: usize,
    /// Multiplier applied to a parent's score for its neighbors.
    pub expansion_discount: f32,
    pub rewrite_query: bool,
    pub include_architecture: bool,
}

impl From<&RetrievalConfig> for RetrievalOptions {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            top_k: config.top_k,
            rerank_top_k: config.rerank_top_k,
            expand_per_node: config.expand_per_node,
            expansion_discount: config.expansion_discount,
            rewrite_query: config.rewrite_queries,
            include_architecture: true,
        }
    }
}

impl RetrievalOptions {
    /// Set K₁
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set K₂
    pub fn with_rerank_top_k(mut self, rerank_top_k: usize) -> Self {
        self.rerank_top_k = rerank_top_k;
        self
    }

    /// Enable or disable query rewriting
    pub fn with_rewrite(mut self, rewrite: bool) -> Self {
        self.rewrite_query = rewrite;
        self
    }
}

/// Retrieval service over the knowledge store and the gateway.
#[derive(Clone)]
pub struct RetrievalService {
    storage: SqliteStorage,
    gateway: Gateway,
    config: RetrievalConfig,
    timeout_ms: u64,
}

impl RetrievalService {
    pub fn new(
        storage: SqliteStorage,
        gateway: Gateway,
        config: RetrievalConfig,
        timeout_ms: u64,
    ) -> Self {
        Self {
            storage,
            gateway,
            config,
            timeout_ms,
        }
    }

    /// Default options from configuration
    pub fn options(&self) -> RetrievalOptions {
        RetrievalOptions::from(&self.config)
    }

    /// Retrieve with the configured defaults
    pub async fn retrieve(&self, query: &str, cancel: &CancellationToken) -> AppResult<KgContext> {
        self.retrieve_with(query, &self.options(), cancel).await
    }

    /// Retrieve with explicit options
    pub async fn retrieve_with(
        &self,
        query: &str,
        options: &RetrievalOptions,
        cancel: &CancellationToken,
    ) -> AppResult<KgContext> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::user("query must not be empty"));
        }

        let mut steps: Vec<String> = Vec::new();
        let mut results: Vec<ScoredNode> = Vec::new();

        let has_vectors = cancellable(cancel, self.storage.embedding_dimensions())
            .await?
            .is_some();

        if has_vectors && options.top_k > 0 {
            let search_query = if options.rewrite_query {
                match self.rewrite(query, cancel).await {
                    Ok(Some(rewritten)) => {
                        steps.push("query rewritten".to_string());
                        rewritten
                    }
                    Ok(None) => query.to_string(),
                    Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                    Err(e) => {
                        warn!(error = %e, "Query rewrite failed, using raw query");
                        query.to_string()
                    }
                }
            } else {
                query.to_string()
            };

            let vector = self.embed_query(&search_query, cancel).await?;
            let hits = cancellable(cancel, self.storage.vector_search(&vector, options.top_k)).await?;
            debug!(hits = hits.len(), top_k = options.top_k, "Vector search finished");

            if !hits.is_empty() {
                steps.push(format!("vector search ({} hits)", hits.len()));
                let candidates: Vec<ScoredNode> = hits
                    .into_iter()
                    .map(|(node, score)| ScoredNode {
                        node,
                        score,
                        expanded_from: None,
                    })
                    .collect();

                let survivors = self
                    .rerank(&search_query, candidates, options, &mut steps, cancel)
                    .await?;

                let expanded = self.expand(&survivors, options, cancel).await?;
                if !expanded.is_empty() {
                    steps.push(format!("graph expansion (+{})", expanded.len()));
                }
                results = survivors;
                results.extend(expanded);
                sort_scored(&mut results);
            }
        }

        if options.include_architecture {
            match self.architecture_node(cancel).await {
                Ok(Some(architecture)) => {
                    results.retain(|s| s.node.id != architecture.id);
                    let top = results.first().map(|s| s.score).unwrap_or(0.0);
                    results.insert(
                        0,
                        ScoredNode {
                            node: architecture,
                            score: top.max(1.0),
                            expanded_from: None,
                        },
                    );
                    steps.push("architecture overview".to_string());
                }
                Ok(None) => {}
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => warn!(error = %e, "Architecture lookup failed"),
            }
        }

        if results.is_empty() {
            info!(query, "Retrieval found no relevant memory");
            return Ok(KgContext::empty());
        }

        info!(
            query,
            results = results.len(),
            strategy = %steps.join("; "),
            "Retrieval finished"
        );

        Ok(KgContext {
            context_text: render_context(&results),
            scored_nodes: results,
            strategy: steps.join("; "),
        })
    }

    /// Rewrite a question into a retrieval statement; `None` if the model returned nothing usable.
    async fn rewrite(&self, query: &str, cancel: &CancellationToken) -> AppResult<Option<String>> {
        let request = ChatRequest::new(vec![
            Message::system(QUERY_REWRITE_PROMPT),
            Message::user(query),
        ])
        .with_temperature(0.0)
        .with_max_tokens(REWRITE_MAX_TOKENS);
        let (text, _) = with_deadline(cancel, self.timeout_ms, self.gateway.chat(request)).await?;
        let rewritten = text
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(|l| l.trim_matches('"').to_string());
        Ok(rewritten.filter(|r| !r.is_empty() && r != query))
    }

    async fn embed_query(&self, query: &str, cancel: &CancellationToken) -> AppResult<Vec<f32>> {
        let texts = vec![query.to_string()];
        let mut vectors = with_deadline(cancel, self.timeout_ms, self.gateway.embed(&texts)).await?;
        vectors.pop().ok_or_else(|| AppError::Internal {
            message: "embedder returned no vector for the query".to_string(),
        })
    }

    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<ScoredNode>,
        options: &RetrievalOptions,
        steps: &mut Vec<String>,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<ScoredNode>> {
        let Some(reranker) = self.gateway.reranker() else {
            return Ok(candidates);
        };

        let texts: Vec<String> = candidates.iter().map(|c| c.node.embedding_text()).collect();
        match with_deadline(cancel, self.timeout_ms, reranker.rerank(query, &texts)).await {
            Ok(hits) if !hits.is_empty() => {
                let mut slots: Vec<Option<ScoredNode>> = candidates.into_iter().map(Some).collect();
                let mut reranked: Vec<ScoredNode> = hits
                    .into_iter()
                    .filter_map(|hit| {
                        slots.get_mut(hit.index).and_then(Option::take).map(|mut c| {
                            c.score = hit.score;
                            c
                        })
                    })
                    .collect();
                sort_scored(&mut reranked);
                reranked.truncate(options.rerank_top_k);
                steps.push(format!("reranked (kept {})", reranked.len()));
                Ok(reranked)
            }
            Ok(_) => Ok(candidates),
            Err(AppError::Cancelled) => Err(AppError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Reranker failed, keeping vector ranking");
                Ok(candidates)
            }
        }
    }

    /// One-hop expansion; storage failures skip the affected node.
    async fn expand(
        &self,
        survivors: &[ScoredNode],
        options: &RetrievalOptions,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<ScoredNode>> {
        if options.expand_per_node == 0 {
            return Ok(Vec::new());
        }

        let discount = options.expansion_discount.clamp(0.0, 1.0);
        let mut seen: HashSet<String> = survivors.iter().map(|s| s.node.id.clone()).collect();
        let mut expanded = Vec::new();

        for parent in survivors {
            let edges = match cancellable(cancel, self.storage.neighbors(&parent.node.id)).await {
                Ok(edges) => edges,
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    warn!(node_id = %parent.node.id, error = %e, "Graph expansion skipped");
                    continue;
                }
            };

            let mut added = 0;
            for edge in edges {
                if added >= options.expand_per_node {
                    break;
                }
                let neighbor_id = edge.other_end(&parent.node.id).to_string();
                if seen.contains(&neighbor_id) {
                    continue;
                }
                match cancellable(cancel, self.storage.get_node(&neighbor_id)).await {
                    Ok(Some(node)) => {
                        seen.insert(neighbor_id);
                        expanded.push(ScoredNode {
                            node,
                            score: parent.score * discount,
                            expanded_from: Some(parent.node.id.clone()),
                        });
                        added += 1;
                    }
                    Ok(None) => {}
                    Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                    Err(e) => {
                        warn!(node_id = %neighbor_id, error = %e, "Neighbor lookup failed");
                    }
                }
            }
        }

        Ok(expanded)
    }

    async fn architecture_node(&self, cancel: &CancellationToken) -> AppResult<Option<Node>> {
        let metadata = cancellable(cancel, self.storage.list_nodes(Some(NodeType::Metadata))).await?;
        Ok(metadata
            .into_iter()
            .rev()
            .find(|n| n.source_agent == ARCHITECTURE_AGENT))
    }
}

/// Descending score; ties go to the earlier-created node, then the smaller id.
fn sort_scored(nodes: &mut [ScoredNode]) {
    nodes.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.node.created_at.cmp(&b.node.created_at))
            .then_with(|| a.node.id.cmp(&b.node.id))
    });
}

fn render_context(nodes: &[ScoredNode]) -> String {
    nodes
        .iter()
        .map(|s| {
            let content: String = s.node.content.chars().take(MAX_CONTENT_CHARS).collect();
            format!(
                "### [{}] {} (score {:.2})\n{}\n",
                s.node.node_type, s.node.summary, s.score, content
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn scored(id: &str, score: f32, age_secs: i64) -> ScoredNode {
        let mut node = Node::new(NodeType::Note, id, "body");
        node.id = id.to_string();
        node.created_at = Utc::now() - Duration::seconds(age_secs);
        ScoredNode {
            node,
            score,
            expanded_from: None,
        }
    }

    #[test]
    fn test_sort_scored_ties_prefer_older() {
        let mut nodes = vec![scored("new", 0.5, 1), scored("top", 0.9, 0), scored("old", 0.5, 100)];
        sort_scored(&mut nodes);
        let ids: Vec<&str> = nodes.iter().map(|s| s.node.id.as_str()).collect();
        assert_eq!(ids, vec!["top", "old", "new"]);
    }

    #[test]
    fn test_render_context_truncates_content() {
        let mut node = scored("n", 0.7, 0);
        node.node.content = "x".repeat(MAX_CONTENT_CHARS + 100);
        let text = render_context(&[node]);
        assert!(text.starts_with("### [note] n (score 0.70)"));
        assert!(text.len() < MAX_CONTENT_CHARS + 100);
    }

    #[test]
    fn test_empty_context() {
        let ctx = KgContext::empty();
        assert!(ctx.is_empty());
        assert_eq!(ctx.strategy, NO_RELEVANT_MEMORY);
    }

    #[test]
    fn test_options_from_config() {
        let options = RetrievalOptions::from(&RetrievalConfig::default())
            .with_top_k(3)
            .with_rewrite(false);
        assert_eq!(options.top_k, 3);
        assert_eq!(options.rerank_top_k, 5);
        assert!(!options.rewrite_query);
    }
}
