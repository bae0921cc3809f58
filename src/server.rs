use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    config::BaseConfig,
    error::{ControlError, SetupError},
    export::{self, ExportFormat},
    registry::ScanRegistry,
    types::ScanRequest,
};

#[derive(Clone)]
pub struct AppState {
    registry: Arc<ScanRegistry>,
}

/// Error body is always `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    Setup(SetupError),
    Control(ControlError),
}

impl From<SetupError> for ApiError {
    fn from(e: SetupError) -> Self {
        ApiError::Setup(e)
    }
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        ApiError::Control(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, msg) = match &self {
            ApiError::Setup(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::Control(e @ ControlError::NotFound(_)) => (StatusCode::NOT_FOUND, e.to_string()),
            ApiError::Control(e) => (StatusCode::CONFLICT, e.to_string()),
        };
        (code, Json(json!({ "error": msg }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: ExportFormat,
}

/// API routes under `/api`, wrapped in request tracing.
pub fn router(registry: Arc<ScanRegistry>) -> Router {
    let api = Router::new()
        .route("/scans", post(post_scan))
        .route("/scans/{id}", get(get_status))
        .route("/scans/{id}/pause", post(post_pause))
        .route("/scans/{id}/resume", post(post_resume))
        .route("/scans/{id}/stop", post(post_stop))
        .route("/scans/{id}/export", get(get_export))
        .with_state(AppState { registry });

    Router::new()
        .nest("/api", api)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

pub async fn spawn_server(bind: &str, registry: Arc<ScanRegistry>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!("serving API on http://{}", listener.local_addr()?);
    axum::serve(listener, router(registry)).await?;
    Ok(())
}

async fn post_scan(State(app): State<AppState>, Json(req): Json<ScanRequest>) -> Result<impl IntoResponse, ApiError> {
    let id = app.registry.start(req).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "scan_id": id }))))
}

async fn get_status(State(app): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = app.registry.status(&id).await?;
    Ok((StatusCode::OK, Json(snapshot)))
}

async fn post_pause(State(app): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    app.registry.pause(&id).await?;
    control_ack(&app, &id).await
}

async fn post_resume(State(app): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    app.registry.resume(&id).await?;
    control_ack(&app, &id).await
}

async fn post_stop(State(app): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    app.registry.stop(&id).await?;
    control_ack(&app, &id).await
}

async fn control_ack(app: &AppState, id: &str) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let controller = app.registry.get(id).await?;
    let status = controller.status().await;
    Ok((StatusCode::OK, Json(json!({ "scan_id": controller.id(), "status": status }))))
}

async fn get_export(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let controller = app.registry.get(&id).await?;
    let base: BaseConfig = controller
        .request()
        .base_config
        .parse()
        .map_err(|e| ApiError::Setup(SetupError::BaseConfig(e)))?;
    let results = controller.results().await;
    let body = export::render(q.format, &results, &base);
    let content_type = match q.format {
        ExportFormat::Base64 => "text/plain; charset=utf-8",
        ExportFormat::Singbox => "application/json",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}
