//! Knowledge-graph ingestion.
//!
//! Runs the selected bootstrap agents concurrently over a project
//! directory, embeds every finding in one batch, persists the nodes and
//! links semantically similar ones.

mod collect;

pub use collect::{architecture_document, gather};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agents::{AgentInput, AgentRuntime, BootstrapAgent, BootstrapKind, Finding};
use crate::cancel::{cancellable, with_deadline};
use crate::error::{AppError, AppResult};
use crate::events::EventSink;
use crate::llm::Gateway;
use crate::retrieval::ARCHITECTURE_AGENT;
use crate::storage::{
    cosine_similarity, relation, ActivityEntry, Edge, Node, NodeType, SqliteStorage, Storage,
};

/// Minimum cosine similarity for a `semantically_similar` edge.
pub const SIMILARITY_THRESHOLD: f32 = 0.75;

/// Input to a bootstrap run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRequest {
    pub project_path: PathBuf,
    /// Agents to run; empty runs all of them.
    #[serde(default)]
    pub agents: Vec<BootstrapKind>,
    /// Replace existing knowledge instead of adding to it.
    #[serde(default)]
    pub clear: bool,
}

impl BootstrapRequest {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            agents: Vec::new(),
            clear: false,
        }
    }

    pub fn with_agents(mut self, agents: Vec<BootstrapKind>) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_clear(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }
}

/// Per-agent outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentReport {
    pub agent: String,
    pub findings: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a bootstrap run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BootstrapReport {
    pub nodes_created: usize,
    pub edges_created: usize,
    /// Persisted node counts by type.
    pub counts: BTreeMap<String, usize>,
    pub agents: Vec<AgentReport>,
    pub architecture: bool,
}

/// Ingestion service.
#[derive(Clone)]
pub struct BootstrapService {
    storage: SqliteStorage,
    gateway: Gateway,
    runtime: AgentRuntime,
    timeout_ms: u64,
}

impl BootstrapService {
    pub fn new(storage: SqliteStorage, gateway: Gateway, runtime: AgentRuntime, timeout_ms: u64) -> Self {
        Self {
            storage,
            gateway,
            runtime,
            timeout_ms,
        }
    }

    /// Run the selected agents and persist what they find.
    ///
    /// A failing agent is reported and does not stop the others.
    /// Clearing and writing happen in one transaction after embedding
    /// succeeds, so any failure leaves the previous graph untouched.
    pub async fn run(
        &self,
        request: BootstrapRequest,
        sink: Arc<dyn EventSink>,
        cancel: &CancellationToken,
    ) -> AppResult<BootstrapReport> {
        let root = request.project_path.clone();
        if !root.is_dir() {
            return Err(AppError::user(format!(
                "project path {} is not a directory",
                root.display()
            )));
        }

        let mut kinds: Vec<BootstrapKind> = if request.agents.is_empty() {
            BootstrapKind::ALL.to_vec()
        } else {
            request.agents.clone()
        };
        kinds.sort_by_key(|k| BootstrapKind::ALL.iter().position(|a| a == k));
        kinds.dedup();

        info!(project = %root.display(), agents = ?kinds, clear = request.clear, "Starting bootstrap");

        let gather_root = root.clone();
        let gather_kinds = kinds.clone();
        let (materials, architecture) = tokio::task::spawn_blocking(move || {
            let materials: Vec<(BootstrapKind, String)> = gather_kinds
                .into_iter()
                .map(|k| (k, gather(&gather_root, k)))
                .collect();
            (materials, architecture_document(&gather_root))
        })
        .await
        .map_err(|e| AppError::Internal {
            message: format!("project scan failed: {}", e),
        })?;

        let (findings, agent_reports) = self.run_agents(&root, materials, sink, cancel).await?;

        let mut nodes: Vec<Node> = findings
            .into_iter()
            .map(|(kind, f)| {
                Node::new(f.node_type, f.summary, f.content).with_source_agent(kind.as_str())
            })
            .collect();
        let has_architecture = architecture.is_some();
        if let Some(document) = architecture {
            nodes.push(
                Node::new(NodeType::Metadata, "Architecture overview", document)
                    .with_source_agent(ARCHITECTURE_AGENT),
            );
        }

        if !nodes.is_empty() {
            let texts: Vec<String> = nodes.iter().map(Node::embedding_text).collect();
            let vectors = with_deadline(cancel, self.timeout_ms, self.gateway.embed(&texts)).await?;
            for (node, vector) in nodes.iter_mut().zip(vectors) {
                node.embedding = Some(vector);
            }
        }

        let edges = similar_edges(&nodes);
        cancellable(
            cancel,
            self.storage.replace_knowledge(request.clear, &nodes, &edges),
        )
        .await?;
        let edges_created = edges.len();

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for node in &nodes {
            *counts.entry(node.node_type.to_string()).or_default() += 1;
        }

        let report = BootstrapReport {
            nodes_created: nodes.len(),
            edges_created,
            counts,
            agents: agent_reports,
            architecture: has_architecture,
        };

        let entry = ActivityEntry::new(
            "bootstrap",
            format!(
                "Bootstrapped {} ({} nodes, {} edges)",
                root.display(),
                report.nodes_created,
                report.edges_created
            ),
        )
        .with_detail(serde_json::to_value(&report).unwrap_or_default());
        if let Err(e) = self.storage.log_activity(&entry).await {
            warn!(error = %e, "Failed to log bootstrap activity");
        }

        info!(
            nodes = report.nodes_created,
            edges = report.edges_created,
            "Bootstrap finished"
        );
        Ok(report)
    }

    async fn run_agents(
        &self,
        root: &std::path::Path,
        materials: Vec<(BootstrapKind, String)>,
        sink: Arc<dyn EventSink>,
        cancel: &CancellationToken,
    ) -> AppResult<(Vec<(BootstrapKind, Finding)>, Vec<AgentReport>)> {
        let mut reports: BTreeMap<usize, AgentReport> = BTreeMap::new();
        let mut results: BTreeMap<usize, (BootstrapKind, Vec<Finding>)> = BTreeMap::new();
        let mut set = JoinSet::new();

        for (order, (kind, material)) in materials.into_iter().enumerate() {
            if material.trim().is_empty() {
                reports.insert(
                    order,
                    AgentReport {
                        agent: kind.to_string(),
                        findings: 0,
                        warning: Some("no relevant files found".to_string()),
                        error: None,
                    },
                );
                continue;
            }

            let runtime = self.runtime.clone();
            let sink = Arc::clone(&sink);
            let cancel = cancel.clone();
            let input = AgentInput::new(format!(
                "Extract architectural knowledge from the project at {}",
                root.display()
            ))
            .with_section("Project material", material);

            set.spawn(async move {
                let agent = BootstrapAgent::new(kind);
                let result = runtime.run(&agent, &input, sink.as_ref(), &cancel).await;
                (order, kind, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (order, kind, result) = match joined {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "Bootstrap agent task failed");
                    continue;
                }
            };
            match result {
                Ok(output) => {
                    reports.insert(
                        order,
                        AgentReport {
                            agent: kind.to_string(),
                            findings: output.result.findings.len(),
                            warning: output.warning,
                            error: None,
                        },
                    );
                    results.insert(order, (kind, output.result.findings));
                }
                Err(AppError::Cancelled) => {
                    set.abort_all();
                    return Err(AppError::Cancelled);
                }
                Err(e) => {
                    warn!(agent = %kind, error = %e, "Bootstrap agent failed");
                    reports.insert(
                        order,
                        AgentReport {
                            agent: kind.to_string(),
                            findings: 0,
                            warning: None,
                            error: Some(e.user_message()),
                        },
                    );
                }
            }
        }

        let findings = results
            .into_values()
            .flat_map(|(kind, findings)| findings.into_iter().map(move |f| (kind, f)))
            .collect();
        Ok((findings, reports.into_values().collect()))
    }
}

/// `semantically_similar` edges between nodes at or above the threshold.
fn similar_edges(nodes: &[Node]) -> Vec<Edge> {
    let mut edges = Vec::new();
    for (i, a) in nodes.iter().enumerate() {
        let Some(va) = a.embedding.as_deref() else {
            continue;
        };
        for b in &nodes[i + 1..] {
            let Some(vb) = b.embedding.as_deref() else {
                continue;
            };
            let similarity = cosine_similarity(va, vb);
            if similarity >= SIMILARITY_THRESHOLD {
                edges.push(
                    Edge::new(&a.id, &b.id, relation::SEMANTICALLY_SIMILAR)
                        .with_confidence(similarity),
                );
            }
        }
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_uses_camel_case() {
        let request: BootstrapRequest = serde_json::from_str(
            r#"{"projectPath":"/tmp/demo","agents":["docs","deps"],"clear":true}"#,
        )
        .unwrap();
        assert_eq!(request.project_path, PathBuf::from("/tmp/demo"));
        assert_eq!(request.agents, vec![BootstrapKind::Docs, BootstrapKind::Deps]);
        assert!(request.clear);
    }

    #[test]
    fn test_similar_edges_threshold() {
        let node = |v: Vec<f32>| Node::new(NodeType::Feature, "n", "").with_embedding(v);
        let nodes = vec![
            node(vec![1.0, 0.0]),
            node(vec![0.8, 0.6]),
            node(vec![0.0, 1.0]),
            Node::new(NodeType::Note, "no vector", ""),
        ];

        let edges = similar_edges(&nodes);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].from_node, nodes[0].id);
        assert_eq!(edges[0].to_node, nodes[1].id);
        assert!((edges[0].confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_request_defaults() {
        let request: BootstrapRequest =
            serde_json::from_str(r#"{"projectPath":"."}"#).unwrap();
        assert!(request.agents.is_empty());
        assert!(!request.clear);
    }
}
