use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use spaghettihub_common::{PortingWorkRecord, WorkStatus};
use tracing::{debug, error, warn};

use crate::engine::LocalEngine;
use crate::errors::{EngineError, IngressError, PortingError};
use crate::ingress::{EventKind, SIGNATURE_HEADER, WebhookVerifier};
use crate::porting::PortingService;
use crate::store::Store;
use crate::webhooks::WebhookDispatcher;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: Store,
    pub engine: Arc<LocalEngine>,
    pub verifier: WebhookVerifier,
    pub dispatcher: WebhookDispatcher,
    pub porting: PortingService,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Deserialize)]
pub struct PortingRequestBody {
    pub launchpad_url: String,
}

/// What the UI polls for. `NEW` means poll again.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PortingStatusView {
    pub request_uuid: String,
    pub status: WorkStatus,
    pub github_url: Option<String>,
    pub launchpad_url: String,
}

impl From<PortingWorkRecord> for PortingStatusView {
    fn from(work: PortingWorkRecord) -> Self {
        Self {
            request_uuid: work.request_uuid,
            status: work.status,
            github_url: work.github_url,
            launchpad_url: work.launchpad_url,
        }
    }
}

#[derive(Deserialize)]
pub struct CommitQuery {
    pub query: Option<String>,
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub size: u32,
}

fn default_page_size() -> u32 {
    20
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Forbidden(String),
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<IngressError> for ApiError {
    fn from(err: IngressError) -> Self {
        if err.is_authentication() {
            ApiError::Forbidden(err.to_string())
        } else {
            ApiError::BadRequest(err.to_string())
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Unavailable(err.to_string())
    }
}

impl From<PortingError> for ApiError {
    fn from(err: PortingError) -> Self {
        match err {
            PortingError::InvalidLaunchpadUrl(_) => ApiError::BadRequest(err.to_string()),
            PortingError::StartFailed { .. } => ApiError::Unavailable(err.to_string()),
            PortingError::Other(e) => ApiError::Internal(format!("{:#}", e)),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", err))
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/github_workflow_webhook", post(github_workflow_webhook))
        .route("/push_webhook", post(push_webhook))
        .route("/api/porting", post(request_porting))
        .route("/api/porting/{request_uuid}", get(porting_status))
        .route("/api/commits", get(list_commits))
        .route("/api/workflows/{id}", get(describe_workflow))
        .route("/health", get(health_check))
}

// ── Webhooks ──────────────────────────────────────────────────────────

async fn receive_webhook(
    state: &AppState,
    kind: EventKind,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<StatusCode, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let event = state.verifier.accept(kind, signature, body).map_err(|e| {
        warn!(kind = kind.as_str(), error = %e, "Rejected webhook delivery");
        ApiError::from(e)
    })?;

    let dispatched = state.dispatcher.dispatch(event).await.map_err(|e| {
        error!(kind = kind.as_str(), error = %e, "Failed to queue webhook event");
        ApiError::from(e)
    })?;
    debug!(kind = kind.as_str(), ?dispatched, "Webhook accepted");
    Ok(StatusCode::ACCEPTED)
}

async fn github_workflow_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    receive_webhook(&state, EventKind::WorkflowJob, &headers, &body).await
}

async fn push_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    receive_webhook(&state, EventKind::Push, &headers, &body).await
}

// ── Porting ───────────────────────────────────────────────────────────

async fn request_porting(
    State(state): State<SharedState>,
    Json(body): Json<PortingRequestBody>,
) -> Result<(StatusCode, Json<PortingStatusView>), ApiError> {
    let work = state.porting.request(&body.launchpad_url).await?;
    Ok((StatusCode::ACCEPTED, Json(work.into())))
}

async fn porting_status(
    State(state): State<SharedState>,
    Path(request_uuid): Path<String>,
) -> Result<Json<PortingStatusView>, ApiError> {
    let work = state
        .porting
        .status(&request_uuid)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Porting request {} not found", request_uuid)))?;
    Ok(Json(work.into()))
}

// ── Read models ───────────────────────────────────────────────────────

async fn list_commits(
    State(state): State<SharedState>,
    Query(q): Query<CommitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = state
        .store
        .call(move |db| db.list_commits(q.query.as_deref(), q.page, q.size))
        .await?;
    Ok(Json(page))
}

async fn describe_workflow(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance = state
        .engine
        .describe(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Workflow {} not found", id)))?;
    Ok(Json(instance))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}
