//! HTTP API over the pipeline.
//!
//! JSON in and out. Cross-origin access is limited to the configured
//! allow-list; preflight requests from any other origin get a 403 before
//! they reach the CORS layer.

mod error;
mod handlers;

pub use error::{ApiError, ApiResult};
pub use handlers::{activity_limit, edge_style, EdgeStyle, DEFAULT_ACTIVITY_LIMIT, MAX_ACTIVITY_LIMIT};

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::pipeline::Pipeline;

/// State shared by every handler.
pub struct ApiState {
    pub pipeline: Pipeline,
    allowed_origins: Vec<String>,
    shutdown: CancellationToken,
}

impl ApiState {
    pub fn new(pipeline: Pipeline, shutdown: CancellationToken) -> Self {
        let allowed_origins = pipeline.config().server.cors_origins.clone();
        Self {
            pipeline,
            allowed_origins,
            shutdown,
        }
    }

    /// Token for one request; cancelled when the server shuts down.
    pub fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn is_allowed_origin(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == origin)
    }
}

/// Build the router with CORS, preflight filtering and request tracing.
pub fn create_router(state: Arc<ApiState>) -> Router {
    let cors = build_cors_layer(&state.allowed_origins);

    Router::new()
        .route("/api/nodes", get(handlers::list_nodes))
        .route("/api/nodes/:id", get(handlers::get_node))
        .route("/api/search", post(handlers::search))
        .route("/api/stats", get(handlers::stats))
        .route("/api/agents", get(handlers::agents))
        .route("/api/edges", get(handlers::edges))
        .route("/api/bootstrap", post(handlers::bootstrap))
        .route(
            "/api/activity",
            get(handlers::list_activity).delete(handlers::clear_activity),
        )
        .route(
            "/api/plans",
            get(handlers::list_plans).post(handlers::create_plan),
        )
        .route("/api/plans/clarify", post(handlers::clarify))
        .route("/api/plans/generate", post(handlers::generate))
        .route("/api/plans/:id", get(handlers::get_plan))
        .route("/api/tasks/promote", post(handlers::promote))
        .layer(cors)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            reject_disallowed_preflight,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(pipeline: Pipeline, shutdown: CancellationToken) -> AppResult<()> {
    let addr = pipeline.config().server.addr.clone();
    let state = Arc::new(ApiState::new(pipeline, shutdown.clone()));
    let router = create_router(state);

    let listener = TcpListener::bind(&addr).await.map_err(|e| AppError::Config {
        message: format!("cannot bind {}: {}", addr, e),
    })?;
    info!(addr = %addr, "HTTP API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| AppError::Internal {
            message: format!("server error: {}", e),
        })?;

    info!("HTTP API stopped");
    Ok(())
}

async fn reject_disallowed_preflight(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        let origin = request
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok());
        if let Some(origin) = origin {
            if !state.is_allowed_origin(origin) {
                warn!(origin, path = %request.uri().path(), "Rejected preflight from disallowed origin");
                return ApiError::forbidden(format!("origin {} is not allowed", origin))
                    .into_response();
            }
        }
    }
    next.run(request).await
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let mut parsed = Vec::new();
    for origin in allowed_origins {
        match HeaderValue::from_str(origin) {
            Ok(value) => parsed.push(value),
            Err(err) => warn!("ignoring invalid CORS origin '{origin}': {err}"),
        }
    }

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(parsed)
}
