use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{ApiError, ApiResult};
use super::ApiState;
use crate::agents::BootstrapKind;
use crate::bootstrap::{BootstrapReport, BootstrapRequest};
use crate::clarify::{ClarifyRequest, ClarifyResult};
use crate::error::{AppError, StorageError};
use crate::events::TracingSink;
use crate::pipeline::{
    CreatePlanRequest, PlanWithTasks, PromoteRequest, PromoteResult, SearchRequest, SearchResponse,
};
use crate::planner::{GenerateRequest, GenerateResult};
use crate::storage::{relation, ActivityEntry, Edge, Node, NodeType, Plan, Storage};

/// Default and maximum page size for `/api/activity`.
pub const DEFAULT_ACTIVITY_LIMIT: usize = 50;
pub const MAX_ACTIVITY_LIMIT: usize = 200;

type Shared = State<Arc<ApiState>>;

// --- Nodes ---

#[derive(Deserialize)]
pub struct NodeQuery {
    #[serde(rename = "type")]
    pub node_type: Option<String>,
}

/// GET /api/nodes
pub async fn list_nodes(
    State(state): Shared,
    query: Result<Query<NodeQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<Node>>> {
    let Query(query) = query?;
    let filter = match query.node_type.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<NodeType>().map_err(ApiError::bad_request)?),
    };
    let nodes = state
        .pipeline
        .storage()
        .list_nodes(filter)
        .await
        .map_err(AppError::from)?;
    Ok(Json(nodes))
}

/// GET /api/nodes/:id
pub async fn get_node(
    State(state): Shared,
    id: Result<Path<String>, PathRejection>,
) -> ApiResult<Json<Node>> {
    let Path(id) = id?;
    let node = state
        .pipeline
        .storage()
        .get_node(&id)
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| not_found("node", &id))?;
    Ok(Json(node))
}

// --- Search ---

/// POST /api/search
pub async fn search(
    State(state): Shared,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> ApiResult<Json<SearchResponse>> {
    let Json(request) = payload?;
    let cancel = state.request_token();
    let response = state.pipeline.search(request, &cancel).await?;
    Ok(Json(response))
}

// --- Stats and agents ---

/// GET /api/stats
///
/// `{"total": N, "<type>": count, ...}` for types with at least one node.
pub async fn stats(State(state): Shared) -> ApiResult<Json<Map<String, Value>>> {
    let counts = state
        .pipeline
        .storage()
        .count_nodes_by_type()
        .await
        .map_err(AppError::from)?;

    let mut body = Map::new();
    let total: i64 = counts.iter().map(|(_, n)| n).sum();
    body.insert("total".to_string(), Value::from(total));
    for (node_type, count) in counts.into_iter().filter(|(_, n)| *n > 0) {
        body.insert(node_type.to_string(), Value::from(count));
    }
    Ok(Json(body))
}

#[derive(Debug, Serialize)]
pub struct AgentInfo {
    pub name: String,
    pub description: String,
    pub nodes: i64,
}

#[derive(Debug, Serialize)]
pub struct AgentsResponse {
    pub agents: Vec<AgentInfo>,
    /// Node counts for every source, including non-agent ones.
    pub contributions: BTreeMap<String, i64>,
}

/// GET /api/agents
pub async fn agents(State(state): Shared) -> ApiResult<Json<AgentsResponse>> {
    let contributions: BTreeMap<String, i64> = state
        .pipeline
        .storage()
        .count_nodes_by_agent()
        .await
        .map_err(AppError::from)?
        .into_iter()
        .collect();

    let agents = BootstrapKind::ALL
        .iter()
        .map(|kind| AgentInfo {
            name: kind.to_string(),
            description: kind.description().to_string(),
            nodes: contributions.get(kind.as_str()).copied().unwrap_or(0),
        })
        .collect();

    Ok(Json(AgentsResponse {
        agents,
        contributions,
    }))
}

// --- Edges ---

#[derive(Deserialize)]
pub struct EdgeQuery {
    #[serde(default)]
    pub styled: bool,
}

/// Presentation hints for graph views.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeStyle {
    pub color: &'static str,
    pub dashes: bool,
    pub width: f32,
}

#[derive(Debug, Serialize)]
pub struct EdgeView {
    #[serde(flatten)]
    pub edge: Edge,
    #[serde(flatten)]
    pub style: Option<EdgeStyle>,
}

/// Style for a relation; similarity edges widen with confidence.
pub fn edge_style(edge: &Edge) -> EdgeStyle {
    match edge.relation.as_str() {
        relation::SEMANTICALLY_SIMILAR => EdgeStyle {
            color: "#a855f7",
            dashes: true,
            width: 1.0 + 3.0 * edge.confidence.clamp(0.0, 1.0),
        },
        relation::DEPENDS_ON => EdgeStyle {
            color: "#f97316",
            dashes: false,
            width: 2.0,
        },
        relation::RELATES_TO => EdgeStyle {
            color: "#64748b",
            dashes: false,
            width: 1.5,
        },
        _ => EdgeStyle {
            color: "#cbd5e1",
            dashes: false,
            width: 1.0,
        },
    }
}

/// GET /api/edges
pub async fn edges(
    State(state): Shared,
    query: Result<Query<EdgeQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<EdgeView>>> {
    let Query(query) = query?;
    let edges = state
        .pipeline
        .storage()
        .get_all_node_edges()
        .await
        .map_err(AppError::from)?;
    let views = edges
        .into_iter()
        .map(|edge| EdgeView {
            style: query.styled.then(|| edge_style(&edge)),
            edge,
        })
        .collect();
    Ok(Json(views))
}

// --- Bootstrap ---

/// POST /api/bootstrap
pub async fn bootstrap(
    State(state): Shared,
    payload: Result<Json<BootstrapRequest>, JsonRejection>,
) -> ApiResult<Json<BootstrapReport>> {
    let Json(request) = payload?;
    let cancel = state.request_token();
    let report = state
        .pipeline
        .bootstrap()
        .run(request, Arc::new(TracingSink), &cancel)
        .await?;
    Ok(Json(report))
}

// --- Activity ---

#[derive(Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<usize>,
}

/// Clamp a requested page size to `1..=200`, defaulting to 50.
pub fn activity_limit(requested: Option<usize>) -> usize {
    requested
        .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
        .clamp(1, MAX_ACTIVITY_LIMIT)
}

/// GET /api/activity
pub async fn list_activity(
    State(state): Shared,
    query: Result<Query<ActivityQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<ActivityEntry>>> {
    let Query(query) = query?;
    let entries = state
        .pipeline
        .storage()
        .list_activity(activity_limit(query.limit))
        .await
        .map_err(AppError::from)?;
    Ok(Json(entries))
}

/// DELETE /api/activity
pub async fn clear_activity(State(state): Shared) -> ApiResult<StatusCode> {
    state
        .pipeline
        .storage()
        .clear_activity()
        .await
        .map_err(AppError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Plans ---

/// GET /api/plans
pub async fn list_plans(State(state): Shared) -> ApiResult<Json<Vec<Plan>>> {
    let plans = state
        .pipeline
        .storage()
        .list_plans()
        .await
        .map_err(AppError::from)?;
    Ok(Json(plans))
}

/// POST /api/plans
pub async fn create_plan(
    State(state): Shared,
    payload: Result<Json<CreatePlanRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let cancel = state.request_token();
    let created = state.pipeline.create_plan(request, &cancel).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/plans/:id
pub async fn get_plan(
    State(state): Shared,
    id: Result<Path<String>, PathRejection>,
) -> ApiResult<Json<PlanWithTasks>> {
    let Path(id) = id?;
    let cancel = state.request_token();
    let plan = state.pipeline.plan_with_tasks(&id, &cancel).await?;
    Ok(Json(plan))
}

/// POST /api/plans/clarify
pub async fn clarify(
    State(state): Shared,
    payload: Result<Json<ClarifyRequest>, JsonRejection>,
) -> ApiResult<Json<ClarifyResult>> {
    let Json(request) = payload?;
    let cancel = state.request_token();
    let result = state
        .pipeline
        .clarify()
        .clarify(request, &TracingSink, &cancel)
        .await?;
    Ok(Json(result))
}

/// POST /api/plans/generate
pub async fn generate(
    State(state): Shared,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> ApiResult<Json<GenerateResult>> {
    let Json(request) = payload?;
    let cancel = state.request_token();
    let result = state
        .pipeline
        .planner()
        .generate(request, &TracingSink, &cancel)
        .await?;
    Ok(Json(result))
}

// --- Tasks ---

/// POST /api/tasks/promote
pub async fn promote(
    State(state): Shared,
    payload: Result<Json<PromoteRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let cancel = state.request_token();
    let result: PromoteResult = state.pipeline.promote(request, &cancel).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

fn not_found(entity: &'static str, id: &str) -> ApiError {
    ApiError::from(AppError::from(StorageError::NotFound {
        entity,
        id: id.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_limit_clamps() {
        assert_eq!(activity_limit(None), 50);
        assert_eq!(activity_limit(Some(0)), 1);
        assert_eq!(activity_limit(Some(500)), 200);
        assert_eq!(activity_limit(Some(20)), 20);
    }

    #[test]
    fn test_similarity_edges_scale_with_confidence() {
        let weak = Edge::new("a", "b", relation::SEMANTICALLY_SIMILAR).with_confidence(0.0);
        let strong = Edge::new("a", "b", relation::SEMANTICALLY_SIMILAR).with_confidence(1.0);
        assert!(edge_style(&weak).dashes);
        assert!(edge_style(&strong).width > edge_style(&weak).width);
    }

    #[test]
    fn test_unstyled_edge_view_has_no_style_fields() {
        let view = EdgeView {
            edge: Edge::new("a", "b", relation::RELATES_TO),
            style: None,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("color").is_none());
        assert_eq!(json["relation"], "relates_to");
    }
}
