//! Axum JSON glue over the Fieldwatch query engine.
//!
//! Thin by design: handlers trim query parameters, call the store or the
//! pipeline, and serialize the result. All filtering, joining, and status
//! recomputation lives behind the store's read queries.

use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fieldwatch_storage::IssueFilter;
use fieldwatch_sync::SyncPipeline;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "fieldwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/issues", get(issues_handler))
        .route("/api/responses/{issue_id}", get(responses_handler))
        .route("/api/latest-update", get(latest_update_handler))
        .route("/api/sync", post(sync_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(pipeline: Arc<SyncPipeline>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web listener started");
    axum::serve(listener, app(AppState { pipeline })).await?;
    Ok(())
}

pub async fn serve_from_env(pipeline: Arc<SyncPipeline>) -> anyhow::Result<()> {
    let port: u16 = std::env::var("FIELDWATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    serve(pipeline, port).await
}

#[derive(Debug, Clone, Default, Deserialize)]
struct IssuesQuery {
    search: Option<String>,
    status: Option<String>,
    severity: Option<String>,
    timeframe: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

impl From<IssuesQuery> for IssueFilter {
    fn from(query: IssuesQuery) -> Self {
        let trim = |value: Option<String>| value.map(|v| v.trim().to_string());
        Self {
            search: trim(query.search),
            status: trim(query.status),
            severity: trim(query.severity),
            timeframe: trim(query.timeframe),
            start_date: trim(query.start_date),
            end_date: trim(query.end_date),
        }
    }
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn issues_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IssuesQuery>,
) -> Response {
    match state.pipeline.store().list_issues(&query.into()).await {
        Ok(views) => Json(views).into_response(),
        Err(error) => server_error(error),
    }
}

async fn responses_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(issue_id): AxumPath<String>,
) -> Response {
    match state.pipeline.store().list_responses(&issue_id).await {
        Ok(views) => Json(views).into_response(),
        Err(error) => server_error(error),
    }
}

async fn latest_update_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.store().latest_update_time().await {
        Ok(latest) => Json(json!({ "latest_update": latest })).into_response(),
        Err(error) => server_error(error),
    }
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_once().await {
        Ok(summary) => Json(json!({
            "message": "sync completed successfully",
            "updated_issues": summary.issues_updated,
            "updated_images": summary.images_stored,
            "updated_responses": summary.responses_stored,
        }))
        .into_response(),
        Err(error) => server_error(error),
    }
}

fn server_error(error: anyhow::Error) -> Response {
    error!(%error, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": error.to_string() })),
    )
        .into_response()
}
