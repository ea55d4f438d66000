use std::net::SocketAddr;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::scheduler::TaskState;
use crate::status::StatusAggregator;

#[derive(Deserialize)]
struct TaskFilter {
    state: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(status: StatusAggregator) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/tasks", get(tasks_handler))
        .route("/api/workers", get(workers_handler))
        .layer(cors)
        .with_state(status)
}

/// Serve the read-only status API until `shutdown` fires.
pub async fn run_dashboard(addr: SocketAddr, status: StatusAggregator, shutdown: CancellationToken) {
    let app = router(status);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

async fn status_handler(State(status): State<StatusAggregator>) -> impl IntoResponse {
    Json(status.snapshot().await)
}

async fn tasks_handler(
    State(status): State<StatusAggregator>,
    Query(filter): Query<TaskFilter>,
) -> impl IntoResponse {
    let state = match filter.state.as_deref().map(str::parse::<TaskState>) {
        None => None,
        Some(Ok(state)) => Some(state),
        Some(Err(e)) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };
    Json(status.tasks(state).await).into_response()
}

async fn workers_handler(State(status): State<StatusAggregator>) -> impl IntoResponse {
    Json(status.workers().await)
}
