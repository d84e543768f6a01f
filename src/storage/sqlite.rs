use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use std::str::FromStr;
use tracing::{debug, info};

use super::{
    cosine_similarity, validate_task_graph, ActivityEntry, ClarifySession, Edge, Node, NodeType,
    Plan, PlanStatus, Storage, Task, TaskStatus,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const DIMENSION_KEY: &str = "embedding_dimensions";

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create an in-memory store (tests and ephemeral runs).
    ///
    /// Uses a single long-lived connection so every query sees the same database.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .test_before_acquire(false)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Record the store dimension on first use, reject mismatches afterwards.
async fn ensure_dimension(conn: &mut SqliteConnection, dim: usize) -> StorageResult<()> {
    let existing: Option<(String,)> = sqlx::query_as("SELECT value FROM store_meta WHERE key = ?")
        .bind(DIMENSION_KEY)
        .fetch_optional(&mut *conn)
        .await?;

    match existing {
        Some((value,)) => {
            let stored: usize = value.parse().map_err(|_| StorageError::Query {
                message: format!("corrupt embedding dimension: {}", value),
            })?;
            if stored != dim {
                return Err(StorageError::Conflict {
                    message: format!("embedding dimension {} != {}", dim, stored),
                });
            }
        }
        None => {
            sqlx::query("INSERT INTO store_meta (key, value) VALUES (?, ?)")
                .bind(DIMENSION_KEY)
                .bind(dim.to_string())
                .execute(&mut *conn)
                .await?;
            info!(dimensions = dim, "Recorded embedding dimension");
        }
    }
    Ok(())
}

async fn insert_node(conn: &mut SqliteConnection, node: &Node) -> StorageResult<()> {
    let embedding = node.embedding.as_deref().filter(|e| !e.is_empty());
    if let Some(vector) = embedding {
        ensure_dimension(&mut *conn, vector.len()).await?;
    }

    sqlx::query(
        r#"
        INSERT INTO nodes (id, node_type, summary, content, embedding, source_agent, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&node.id)
    .bind(node.node_type.as_str())
    .bind(&node.summary)
    .bind(&node.content)
    .bind(embedding.map(encode_embedding))
    .bind(&node.source_agent)
    .bind(node.created_at.to_rfc3339())
    .execute(&mut *conn)
    .await
    .map_err(|e| map_unique(e, format!("node {} already exists", node.id)))?;
    Ok(())
}

async fn insert_edge(conn: &mut SqliteConnection, edge: &Edge) -> StorageResult<()> {
    for endpoint in [&edge.from_node, &edge.to_node] {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM nodes WHERE id = ?")
            .bind(endpoint)
            .fetch_optional(&mut *conn)
            .await?;
        if exists.is_none() {
            return Err(StorageError::NotFound {
                entity: "node",
                id: endpoint.clone(),
            });
        }
    }

    sqlx::query(
        r#"
        INSERT INTO edges (from_node, to_node, relation, confidence, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&edge.from_node)
    .bind(&edge.to_node)
    .bind(&edge.relation)
    .bind(edge.confidence.clamp(0.0, 1.0) as f64)
    .bind(edge.created_at.to_rfc3339())
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        map_unique(
            e,
            format!(
                "edge {} -[{}]-> {} already exists",
                edge.from_node, edge.relation, edge.to_node
            ),
        )
    })?;
    Ok(())
}

/// Drop every node and edge and forget the recorded dimension.
async fn delete_knowledge(conn: &mut SqliteConnection) -> StorageResult<()> {
    sqlx::query("DELETE FROM edges").execute(&mut *conn).await?;
    sqlx::query("DELETE FROM nodes").execute(&mut *conn).await?;
    sqlx::query("DELETE FROM store_meta WHERE key = ?")
        .bind(DIMENSION_KEY)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn insert_task(conn: &mut SqliteConnection, task: &Task) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO tasks (id, plan_id, title, description, status, priority, assigned_agent,
                           acceptance_criteria, validation_steps, depends_on, scope, keywords,
                           suggested_recall_queries, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&task.id)
    .bind(&task.plan_id)
    .bind(&task.title)
    .bind(&task.description)
    .bind(task.status.to_string())
    .bind(task.priority)
    .bind(&task.assigned_agent)
    .bind(to_json(&task.acceptance_criteria)?)
    .bind(to_json(&task.validation_steps)?)
    .bind(to_json(&task.depends_on)?)
    .bind(&task.scope)
    .bind(to_json(&task.keywords)?)
    .bind(to_json(&task.suggested_recall_queries)?)
    .bind(task.created_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_plan(conn: &mut SqliteConnection, plan: &Plan) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO plans (id, goal, enriched_goal, goal_summary, status, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&plan.id)
    .bind(&plan.goal)
    .bind(&plan.enriched_goal)
    .bind(&plan.goal_summary)
    .bind(plan.status.to_string())
    .bind(plan.created_at.to_rfc3339())
    .execute(&mut *conn)
    .await
    .map_err(|e| map_unique(e, format!("plan {} already exists", plan.id)))?;
    Ok(())
}

/// Tasks must belong to `plan` and form an acyclic graph inside it.
fn check_plan_tasks(plan: &Plan, tasks: &[Task]) -> StorageResult<()> {
    if let Some(stray) = tasks.iter().find(|t| t.plan_id != plan.id) {
        return Err(StorageError::Conflict {
            message: format!("task {} belongs to plan {}", stray.id, stray.plan_id),
        });
    }
    validate_task_graph(tasks)
}

fn map_unique(e: sqlx::Error, message: String) -> StorageError {
    match e.as_database_error() {
        Some(db) if db.is_unique_violation() => StorageError::Conflict { message },
        _ => StorageError::Sqlx(e),
    }
}

const NODE_COLUMNS: &str = "id, node_type, summary, content, embedding, source_agent, created_at";
const EDGE_COLUMNS: &str = "from_node, to_node, relation, confidence, created_at";
const TASK_COLUMNS: &str = "id, plan_id, title, description, status, priority, assigned_agent, \
     acceptance_criteria, validation_steps, depends_on, scope, keywords, \
     suggested_recall_queries, created_at";

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_node(&self, node: &Node) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_node(&mut *tx, node).await?;
        tx.commit().await?;
        debug!(node_id = %node.id, node_type = %node.node_type, "Node stored");
        Ok(())
    }

    async fn get_node(&self, id: &str) -> StorageResult<Option<Node>> {
        let row: Option<NodeRow> =
            sqlx::query_as(&format!("SELECT {} FROM nodes WHERE id = ?", NODE_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Node::try_from).transpose()
    }

    async fn list_nodes(&self, type_filter: Option<NodeType>) -> StorageResult<Vec<Node>> {
        let rows: Vec<NodeRow> = match type_filter {
            Some(node_type) => {
                sqlx::query_as(&format!(
                    "SELECT {} FROM nodes WHERE node_type = ? ORDER BY seq ASC",
                    NODE_COLUMNS
                ))
                .bind(node_type.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!("SELECT {} FROM nodes ORDER BY seq ASC", NODE_COLUMNS))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(Node::try_from).collect()
    }

    async fn count_nodes_by_type(&self) -> StorageResult<Vec<(NodeType, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT node_type, COUNT(*) FROM nodes GROUP BY node_type ORDER BY node_type",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(t, n)| Ok((parse_enum::<NodeType>(&t)?, n)))
            .collect()
    }

    async fn count_nodes_by_agent(&self) -> StorageResult<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT source_agent, COUNT(*) FROM nodes GROUP BY source_agent ORDER BY source_agent",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn clear_all_knowledge(&self) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        delete_knowledge(&mut *tx).await?;
        tx.commit().await?;

        info!("Cleared all knowledge nodes and edges");
        Ok(())
    }

    async fn replace_knowledge(
        &self,
        clear: bool,
        nodes: &[Node],
        edges: &[Edge],
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        if clear {
            delete_knowledge(&mut *tx).await?;
        }
        for node in nodes {
            insert_node(&mut *tx, node).await?;
        }
        for edge in edges {
            insert_edge(&mut *tx, edge).await?;
        }
        tx.commit().await?;

        info!(
            cleared = clear,
            nodes = nodes.len(),
            edges = edges.len(),
            "Knowledge written"
        );
        Ok(())
    }

    async fn embedding_dimensions(&self) -> StorageResult<Option<usize>> {
        let value: Option<(String,)> =
            sqlx::query_as("SELECT value FROM store_meta WHERE key = ?")
                .bind(DIMENSION_KEY)
                .fetch_optional(&self.pool)
                .await?;

        value
            .map(|(v,)| {
                v.parse().map_err(|_| StorageError::Query {
                    message: format!("corrupt embedding dimension: {}", v),
                })
            })
            .transpose()
    }

    async fn vector_search(&self, query: &[f32], k: usize) -> StorageResult<Vec<(Node, f32)>> {
        if k == 0 || query.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(dim) = self.embedding_dimensions().await? {
            if dim != query.len() {
                return Err(StorageError::Conflict {
                    message: format!("query dimension {} != {}", query.len(), dim),
                });
            }
        }

        let rows: Vec<NodeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM nodes WHERE embedding IS NOT NULL ORDER BY seq ASC",
            NODE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<(Node, f32)> = rows
            .into_iter()
            .map(Node::try_from)
            .map(|node| {
                node.map(|n| {
                    let score = n
                        .embedding
                        .as_deref()
                        .map(|e| cosine_similarity(query, e))
                        .unwrap_or(0.0);
                    (n, score)
                })
            })
            .collect::<StorageResult<_>>()?;

        // Stable sort keeps insertion order for equal scores, so older nodes win ties.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn create_edge(&self, edge: &Edge) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_edge(&mut *tx, edge).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_all_node_edges(&self) -> StorageResult<Vec<Edge>> {
        let rows: Vec<EdgeRow> =
            sqlx::query_as(&format!("SELECT {} FROM edges ORDER BY seq ASC", EDGE_COLUMNS))
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(Edge::from).collect())
    }

    async fn neighbors(&self, node_id: &str) -> StorageResult<Vec<Edge>> {
        let rows: Vec<EdgeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM edges WHERE from_node = ? OR to_node = ? \
             ORDER BY confidence DESC, seq ASC",
            EDGE_COLUMNS
        ))
        .bind(node_id)
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Edge::from).collect())
    }

    async fn create_plan(&self, plan: &Plan) -> StorageResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_plan(&mut *conn, plan).await
    }

    async fn get_plan(&self, id: &str) -> StorageResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, goal, enriched_goal, goal_summary, status, created_at
            FROM plans
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Plan::try_from).transpose()
    }

    async fn list_plans(&self) -> StorageResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, goal, enriched_goal, goal_summary, status, created_at
            FROM plans
            ORDER BY seq DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Plan::try_from).collect()
    }

    async fn update_plan_status(&self, id: &str, status: PlanStatus) -> StorageResult<()> {
        let result = sqlx::query("UPDATE plans SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "plan",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn create_plan_with_tasks(&self, plan: &Plan, tasks: &[Task]) -> StorageResult<()> {
        check_plan_tasks(plan, tasks)?;

        let mut tx = self.pool.begin().await?;
        insert_plan(&mut *tx, plan).await?;
        for task in tasks {
            insert_task(&mut *tx, task).await?;
        }
        tx.commit().await?;

        info!(plan_id = %plan.id, tasks = tasks.len(), "Plan persisted");
        Ok(())
    }

    async fn create_session_plan(
        &self,
        session_id: &str,
        plan: &Plan,
        tasks: &[Task],
    ) -> StorageResult<()> {
        check_plan_tasks(plan, tasks)?;

        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query(
            "UPDATE clarify_sessions SET plan_id = ?, updated_at = ? \
             WHERE id = ? AND plan_id IS NULL",
        )
        .bind(&plan.id)
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            let existing: Option<(Option<String>,)> =
                sqlx::query_as("SELECT plan_id FROM clarify_sessions WHERE id = ?")
                    .bind(session_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match existing {
                None => StorageError::NotFound {
                    entity: "clarify session",
                    id: session_id.to_string(),
                },
                Some((plan_id,)) => StorageError::Conflict {
                    message: format!(
                        "clarify session {} already produced plan {}",
                        session_id,
                        plan_id.unwrap_or_default()
                    ),
                },
            });
        }

        insert_plan(&mut *tx, plan).await?;
        for task in tasks {
            insert_task(&mut *tx, task).await?;
        }
        tx.commit().await?;

        info!(
            plan_id = %plan.id,
            session_id = %session_id,
            tasks = tasks.len(),
            "Session plan persisted"
        );
        Ok(())
    }

    async fn create_task(&self, task: &Task) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        let plan: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM plans WHERE id = ?")
            .bind(&task.plan_id)
            .fetch_optional(&mut *tx)
            .await?;
        if plan.is_none() {
            return Err(StorageError::NotFound {
                entity: "plan",
                id: task.plan_id.clone(),
            });
        }

        for dep in &task.depends_on {
            let found: Option<(i64,)> =
                sqlx::query_as("SELECT 1 FROM tasks WHERE id = ? AND plan_id = ?")
                    .bind(dep)
                    .bind(&task.plan_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if found.is_none() {
                return Err(StorageError::Conflict {
                    message: format!("task {} depends on unknown task {}", task.id, dep),
                });
            }
        }

        insert_task(&mut *tx, task).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> StorageResult<Option<Task>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Task::try_from).transpose()
    }

    async fn list_tasks(&self, plan_id: &str) -> StorageResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM tasks WHERE plan_id = ? ORDER BY seq ASC",
            TASK_COLUMNS
        ))
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Task::try_from).collect()
    }

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> StorageResult<()> {
        let result = sqlx::query("UPDATE tasks SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "task",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn save_clarify_session(&self, session: &ClarifySession) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO clarify_sessions
                (id, goal, context, rounds, max_rounds, is_ready_to_plan, final_enriched_goal,
                 goal_summary, plan_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                goal = excluded.goal,
                context = excluded.context,
                rounds = excluded.rounds,
                max_rounds = excluded.max_rounds,
                is_ready_to_plan = excluded.is_ready_to_plan,
                final_enriched_goal = excluded.final_enriched_goal,
                goal_summary = excluded.goal_summary,
                plan_id = COALESCE(clarify_sessions.plan_id, excluded.plan_id),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session.id)
        .bind(&session.goal)
        .bind(&session.context)
        .bind(to_json(&session.rounds)?)
        .bind(session.max_rounds as i64)
        .bind(session.is_ready_to_plan)
        .bind(&session.final_enriched_goal)
        .bind(&session.goal_summary)
        .bind(&session.plan_id)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_clarify_session(&self, id: &str) -> StorageResult<Option<ClarifySession>> {
        let row: Option<ClarifySessionRow> = sqlx::query_as(
            r#"
            SELECT id, goal, context, rounds, max_rounds, is_ready_to_plan, final_enriched_goal,
                   goal_summary, plan_id, created_at, updated_at
            FROM clarify_sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ClarifySession::try_from).transpose()
    }

    async fn log_activity(&self, entry: &ActivityEntry) -> StorageResult<()> {
        let detail = entry.detail.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO activity (id, kind, summary, detail, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.kind)
        .bind(&entry.summary)
        .bind(&detail)
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_activity(&self, limit: usize) -> StorageResult<Vec<ActivityEntry>> {
        let rows: Vec<ActivityRow> = sqlx::query_as(
            r#"
            SELECT id, kind, summary, detail, created_at
            FROM activity
            ORDER BY seq DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ActivityEntry::from).collect())
    }

    async fn get_activity(&self, id: &str) -> StorageResult<Option<ActivityEntry>> {
        let row: Option<ActivityRow> = sqlx::query_as(
            "SELECT id, kind, summary, detail, created_at FROM activity WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ActivityEntry::from))
    }

    async fn clear_activity(&self) -> StorageResult<()> {
        sqlx::query("DELETE FROM activity")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Little-endian f32 BLOB encoding.
fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> StorageResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(StorageError::Query {
            message: format!("embedding blob length {} is not a multiple of 4", bytes.len()),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::Query {
        message: format!("Failed to serialize column: {}", e),
    })
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> StorageResult<T> {
    serde_json::from_str(text).map_err(|e| StorageError::Query {
        message: format!("Failed to deserialize column: {}", e),
    })
}

fn parse_enum<T: FromStr<Err = String>>(value: &str) -> StorageResult<T> {
    value.parse().map_err(|message| StorageError::Query { message })
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct NodeRow {
    id: String,
    node_type: String,
    summary: String,
    content: String,
    embedding: Option<Vec<u8>>,
    source_agent: String,
    created_at: String,
}

impl TryFrom<NodeRow> for Node {
    type Error = StorageError;

    fn try_from(row: NodeRow) -> StorageResult<Self> {
        Ok(Self {
            id: row.id,
            node_type: parse_enum(&row.node_type)?,
            summary: row.summary,
            content: row.content,
            embedding: row.embedding.as_deref().map(decode_embedding).transpose()?,
            source_agent: row.source_agent,
            created_at: parse_timestamp(&row.created_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct EdgeRow {
    from_node: String,
    to_node: String,
    relation: String,
    confidence: f64,
    created_at: String,
}

impl From<EdgeRow> for Edge {
    fn from(row: EdgeRow) -> Self {
        Self {
            from_node: row.from_node,
            to_node: row.to_node,
            relation: row.relation,
            confidence: row.confidence as f32,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct PlanRow {
    id: String,
    goal: String,
    enriched_goal: String,
    goal_summary: String,
    status: String,
    created_at: String,
}

impl TryFrom<PlanRow> for Plan {
    type Error = StorageError;

    fn try_from(row: PlanRow) -> StorageResult<Self> {
        Ok(Self {
            id: row.id,
            goal: row.goal,
            enriched_goal: row.enriched_goal,
            goal_summary: row.goal_summary,
            status: parse_enum(&row.status)?,
            created_at: parse_timestamp(&row.created_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    plan_id: String,
    title: String,
    description: String,
    status: String,
    priority: i64,
    assigned_agent: Option<String>,
    acceptance_criteria: String,
    validation_steps: String,
    depends_on: String,
    scope: Option<String>,
    keywords: String,
    suggested_recall_queries: String,
    created_at: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = StorageError;

    fn try_from(row: TaskRow) -> StorageResult<Self> {
        Ok(Self {
            id: row.id,
            plan_id: row.plan_id,
            title: row.title,
            description: row.description,
            status: parse_enum(&row.status)?,
            priority: row.priority as i32,
            assigned_agent: row.assigned_agent,
            acceptance_criteria: from_json(&row.acceptance_criteria)?,
            validation_steps: from_json(&row.validation_steps)?,
            depends_on: from_json(&row.depends_on)?,
            scope: row.scope,
            keywords: from_json(&row.keywords)?,
            suggested_recall_queries: from_json(&row.suggested_recall_queries)?,
            created_at: parse_timestamp(&row.created_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ClarifySessionRow {
    id: String,
    goal: String,
    context: String,
    rounds: String,
    max_rounds: i64,
    is_ready_to_plan: bool,
    final_enriched_goal: Option<String>,
    goal_summary: String,
    plan_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<ClarifySessionRow> for ClarifySession {
    type Error = StorageError;

    fn try_from(row: ClarifySessionRow) -> StorageResult<Self> {
        Ok(Self {
            id: row.id,
            goal: row.goal,
            context: row.context,
            rounds: from_json(&row.rounds)?,
            max_rounds: row.max_rounds.max(1) as u32,
            is_ready_to_plan: row.is_ready_to_plan,
            final_enriched_goal: row.final_enriched_goal,
            goal_summary: row.goal_summary,
            plan_id: row.plan_id,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ActivityRow {
    id: String,
    kind: String,
    summary: String,
    detail: Option<String>,
    created_at: String,
}

impl From<ActivityRow> for ActivityEntry {
    fn from(row: ActivityRow) -> Self {
        Self {
            id: row.id,
            kind: row.kind,
            summary: row.summary,
            detail: row.detail.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: parse_timestamp(&row.created_at),
        }
    }
}
