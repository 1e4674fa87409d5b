use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::models::{Decision, InterruptKind};
use crate::orchestrator::{ErrorCode, SessionEvent, Supervisor, SupervisorError};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub supervisor: Supervisor,
    pub events: broadcast::Sender<SessionEvent>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub text: String,
    pub location: Option<String>,
}

#[derive(Deserialize)]
pub struct DocumentQuery {
    pub location: Option<String>,
}

#[derive(Deserialize)]
pub struct ResumeRequest {
    pub decision: String,
    /// The interrupt the caller believes is pending.
    pub interrupt: Option<InterruptKind>,
}

#[derive(Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
}

// ── Error handling ────────────────────────────────────────────────────

pub struct ApiError(pub SupervisorError);

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::SessionNotFound => StatusCode::NOT_FOUND,
        ErrorCode::SessionBusy
        | ErrorCode::InterruptPending
        | ErrorCode::NoPendingInterrupt
        | ErrorCode::InterruptMismatch
        | ErrorCode::WorkflowIncomplete => StatusCode::CONFLICT,
        ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::UnreadableDocument => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::StepFailed | ErrorCode::CollaboratorFailed => StatusCode::BAD_GATEWAY,
        ErrorCode::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.code);
        if status.is_server_error() {
            tracing::warn!(code = %self.0.code, "request failed: {}", self.0.detail);
        }
        (
            status,
            Json(serde_json::json!({
                "error": self.0.code.as_str(),
                "detail": self.0.detail,
                "retryable": self.0.code.is_retryable(),
            })),
        )
            .into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/document", post(create_from_document))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/advance", post(advance_session))
        .route("/api/sessions/{id}/resume", post(resume_session))
        .route("/api/sessions/{id}/history", get(session_history))
        .route("/api/sessions/{id}/submit", post(submit_records))
        .route("/api/chat/{id}", post(chat_session))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_session(
    State(state): State<SharedState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state
        .supervisor
        .create(&req.text, req.location.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn create_from_document(
    State(state): State<SharedState>,
    Query(query): Query<DocumentQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let view = state
        .supervisor
        .create_from_document(&body, query.location.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.supervisor.get_state(&id).await?))
}

async fn advance_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.supervisor.advance(&id).await?))
}

async fn resume_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ResumeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let decision: Decision = req
        .decision
        .parse()
        .map_err(|e: String| SupervisorError::new(ErrorCode::InvalidRequest, e))?;
    Ok(Json(
        state
            .supervisor
            .resume(&id, decision, req.interrupt)
            .await?,
    ))
}

async fn session_history(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.supervisor.history(&id).await?))
}

async fn submit_records(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.supervisor.submit_records(&id).await?))
}

async fn chat_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.supervisor.chat(&id, &req.message).await?))
}
