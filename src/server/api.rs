use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::warn;

use editorial_common::{CheckpointType, ValidationMode, ValidationRequest};

use crate::config::ServiceRole;
use crate::editorial::ValidationService;
use crate::errors::{ClientError, OrchestratorError, ValidationError};
use crate::orchestrator::{
    CheckpointManager, NewCheckpoint, SequenceTracker, StartSequence, Validator,
};

pub const SERVICE_NAME: &str = "editorial-orchestrator";

// ── Shared application state ──────────────────────────────────────────

/// Checkpoint and sequence handling, present when the process plays the
/// orchestrator role.
pub struct Orchestration {
    pub validator: Arc<dyn Validator>,
    pub checkpoints: Arc<CheckpointManager>,
    pub sequences: Arc<SequenceTracker>,
}

pub struct AppState {
    pub role: ServiceRole,
    pub editorial: Option<Arc<ValidationService>>,
    pub orchestration: Option<Orchestration>,
    pub ws_tx: broadcast::Sender<String>,
    pub started_at: Instant,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    fn editorial(&self) -> Result<&Arc<ValidationService>, ApiError> {
        self.editorial.as_ref().ok_or_else(|| self.not_served("validation"))
    }

    fn orchestration(&self) -> Result<&Orchestration, ApiError> {
        self.orchestration.as_ref().ok_or_else(|| self.not_served("orchestration"))
    }

    fn not_served(&self, what: &str) -> ApiError {
        ApiError::NotFound(
            "not_served",
            format!(
                "This process runs with role '{}' and does not serve {} routes",
                self.role, what
            ),
        )
    }
}

// ── Request payload types ─────────────────────────────────────────────

/// Validation body. Fields stay loose so a malformed request is reported
/// with the specific rule it breaks rather than a generic decode error.
#[derive(Debug, Default, Deserialize)]
pub struct ValidateBody {
    #[serde(default)]
    pub content: String,
    pub platform: Option<String>,
    pub content_type: Option<String>,
    pub mode: Option<String>,
    pub checkpoint: Option<String>,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

impl ValidateBody {
    /// `route_mode` is the mode named by the URL, if any.
    fn into_request(
        self,
        route_mode: Option<ValidationMode>,
    ) -> Result<ValidationRequest, ValidationError> {
        let body_mode = self
            .mode
            .as_deref()
            .map(str::parse::<ValidationMode>)
            .transpose()
            .map_err(|_| ValidationError::UnsupportedMode(self.mode.clone().unwrap_or_default()))?;
        let mode = match (route_mode, body_mode) {
            (Some(route), Some(body)) if route != body => {
                return Err(ValidationError::BadRequest(format!(
                    "body mode '{}' does not match endpoint mode '{}'",
                    body, route
                )));
            }
            (Some(mode), _) | (None, Some(mode)) => mode,
            (None, None) => {
                return Err(ValidationError::BadRequest(
                    "mode is required (comprehensive or selective)".into(),
                ));
            }
        };
        let checkpoint = self
            .checkpoint
            .as_deref()
            .map(parse_checkpoint)
            .transpose()?;
        Ok(ValidationRequest {
            content: self.content,
            platform: self.platform,
            content_type: self.content_type,
            mode,
            checkpoint,
            context: self.context,
        })
    }
}

fn parse_checkpoint(raw: &str) -> Result<CheckpointType, ValidationError> {
    raw.parse::<CheckpointType>().map_err(ValidationError::BadRequest)
}

#[derive(Debug, Deserialize)]
pub struct CreateCheckpointRequest {
    #[serde(default)]
    pub content: String,
    pub platform: Option<String>,
    pub checkpoint: Option<String>,
    pub user_notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InterveneRequest {
    #[serde(default)]
    pub user_input: String,
    #[serde(default)]
    pub finalize: bool,
}

#[derive(Debug, Deserialize)]
pub struct StartSequenceRequest {
    #[serde(default)]
    pub content: String,
    pub platform: Option<String>,
    pub skip_research: Option<bool>,
    pub content_ownership: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

/// Each variant carries a machine-readable kind and an actionable detail.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Conflict(&'static str, String),
    Unprocessable(&'static str, String),
    Unavailable(&'static str, String),
    Timeout(&'static str, String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, detail) = match self {
            ApiError::BadRequest(kind, detail) => (StatusCode::BAD_REQUEST, kind, detail),
            ApiError::NotFound(kind, detail) => (StatusCode::NOT_FOUND, kind, detail),
            ApiError::Conflict(kind, detail) => (StatusCode::CONFLICT, kind, detail),
            ApiError::Unprocessable(kind, detail) => {
                (StatusCode::UNPROCESSABLE_ENTITY, kind, detail)
            }
            ApiError::Unavailable(kind, detail) => (StatusCode::SERVICE_UNAVAILABLE, kind, detail),
            ApiError::Timeout(kind, detail) => (StatusCode::GATEWAY_TIMEOUT, kind, detail),
            ApiError::Internal(detail) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", detail),
        };
        if status.is_server_error() {
            warn!(status = status.as_u16(), kind, detail = %detail, "Request failed");
        }
        (status, Json(json!({ "error": kind, "detail": detail }))).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        let kind = err.kind();
        let detail = err.to_string();
        match err {
            ValidationError::RepositoryUnavailable(_) => ApiError::Unavailable(kind, detail),
            ValidationError::InsufficientRules { .. } => ApiError::Unprocessable(kind, detail),
            ValidationError::MissingCheckpoint
            | ValidationError::InvalidModeCheckpointCombination { .. }
            | ValidationError::UnsupportedMode(_)
            | ValidationError::BadRequest(_) => ApiError::BadRequest(kind, detail),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let detail = err.to_string();
        match err {
            OrchestratorError::CheckpointNotFound { .. } => {
                ApiError::NotFound("checkpoint_not_found", detail)
            }
            OrchestratorError::SequenceNotFound { .. } => {
                ApiError::NotFound("sequence_not_found", detail)
            }
            OrchestratorError::InvalidTransition { .. } => {
                ApiError::Conflict("invalid_transition", detail)
            }
            OrchestratorError::SequenceStepTimeout { .. } => {
                ApiError::Timeout("sequence_step_timeout", detail)
            }
            OrchestratorError::Validation(e) => e.into(),
            OrchestratorError::Client(ClientError::Timeout { .. }) => {
                ApiError::Timeout("editorial_timeout", detail)
            }
            OrchestratorError::Client(_) => ApiError::Unavailable("editorial_unavailable", detail),
            OrchestratorError::Store(_) => ApiError::Unavailable("state_store_unavailable", detail),
            OrchestratorError::Other(_) => ApiError::Internal(detail),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest("malformed_body", rejection.body_text())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/validate", post(validate))
        .route("/validate/selective", post(validate_selective))
        .route("/validate/comprehensive", post(validate_comprehensive))
        .route("/cache/stats", get(cache_stats))
        .route("/cache/dump", get(cache_dump))
        .route("/cache/refresh", post(cache_refresh))
        .route("/metrics", get(metrics))
        .route("/editorial/health", get(editorial_health))
        .route("/checkpoints/create", post(create_checkpoint))
        .route("/checkpoints/status/{id}", get(checkpoint_status))
        .route("/checkpoints/{id}/intervene", post(intervene_checkpoint))
        .route("/checkpoints/sequence/start", post(start_sequence))
        .route("/checkpoints/sequence/status/{flow_id}", get(sequence_status))
        .route("/checkpoints/sequence/active", get(active_sequences))
        .route("/health", get(health_check))
}

// ── Validation handlers ───────────────────────────────────────────────

async fn run_validation(
    state: &AppState,
    payload: Result<Json<ValidateBody>, JsonRejection>,
    route_mode: Option<ValidationMode>,
) -> Result<Json<Value>, ApiError> {
    let service = state.editorial()?;
    let Json(body) = payload?;
    let request = body.into_request(route_mode)?;
    let response = service.validate(request).await?;
    let body = serde_json::to_value(response).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(body))
}

async fn validate(
    State(state): State<SharedState>,
    payload: Result<Json<ValidateBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    run_validation(&state, payload, None).await
}

async fn validate_selective(
    State(state): State<SharedState>,
    payload: Result<Json<ValidateBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    run_validation(&state, payload, Some(ValidationMode::Selective)).await
}

async fn validate_comprehensive(
    State(state): State<SharedState>,
    payload: Result<Json<ValidateBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    run_validation(&state, payload, Some(ValidationMode::Comprehensive)).await
}

async fn cache_stats(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.editorial()?.cache().stats()))
}

async fn cache_dump(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let entries = state.editorial()?.cache().dump();
    Ok(Json(json!({ "count": entries.len(), "entries": entries })))
}

async fn cache_refresh(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let removed = state.editorial()?.cache().refresh();
    Ok(Json(json!({ "refreshed": true, "removed": removed })))
}

async fn metrics(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.editorial()?.metrics().summary()))
}

async fn editorial_health(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let service = state.editorial()?;
    let health = service.health().await;
    Ok(Json(json!({
        "status": health.status,
        "repository": service.repository_name(),
        "dependencies": {
            "rule_repository": health.rule_repository,
            "cache": health.cache,
        },
    })))
}

// ── Checkpoint handlers ───────────────────────────────────────────────

async fn create_checkpoint(
    State(state): State<SharedState>,
    payload: Result<Json<CreateCheckpointRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let orchestration = state.orchestration()?;
    let Json(req) = payload?;
    let checkpoint_type = match req.checkpoint.as_deref() {
        Some(raw) => parse_checkpoint(raw)?,
        None => return Err(ValidationError::MissingCheckpoint.into()),
    };
    let checkpoint = orchestration
        .checkpoints
        .create(NewCheckpoint {
            content: req.content,
            platform: req.platform,
            checkpoint_type,
            user_notes: req.user_notes,
        })
        .await?;
    Ok(Json(json!({
        "checkpoint_id": checkpoint.checkpoint_id,
        "status": checkpoint.status,
    })))
}

async fn checkpoint_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let checkpoint = state.orchestration()?.checkpoints.status(&id).await?;
    Ok(Json(checkpoint))
}

async fn intervene_checkpoint(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    payload: Result<Json<InterveneRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let orchestration = state.orchestration()?;
    let Json(req) = payload?;
    let checkpoint = orchestration
        .checkpoints
        .intervene(&id, &req.user_input, req.finalize)
        .await?;
    Ok(Json(json!({
        "checkpoint_id": checkpoint.checkpoint_id,
        "status": checkpoint.status,
    })))
}

// ── Sequence handlers ─────────────────────────────────────────────────

async fn start_sequence(
    State(state): State<SharedState>,
    payload: Result<Json<StartSequenceRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let orchestration = state.orchestration()?;
    let Json(req) = payload?;
    let tracker = &orchestration.sequences;
    let sequence = tracker
        .start(StartSequence {
            content: req.content,
            platform: req.platform,
            skip_research: req.skip_research,
            content_ownership: req.content_ownership,
        })
        .await?;
    Ok(Json(json!({
        "flow_id": sequence.flow_id,
        "status": sequence.status,
        "persistence": tracker.persistence(),
    })))
}

async fn sequence_status(
    State(state): State<SharedState>,
    Path(flow_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.orchestration()?.sequences.status(&flow_id).await?;
    Ok(Json(view))
}

async fn active_sequences(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let active = state.orchestration()?.sequences.active().await?;
    Ok(Json(json!({ "count": active.len(), "flows": active })))
}

// ── Health ────────────────────────────────────────────────────────────

async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let (editorial, editorial_healthy) = match (&state.orchestration, &state.editorial) {
        (Some(orchestration), _) => {
            let health = orchestration.validator.health().await;
            let healthy = health.get("status").and_then(Value::as_str) == Some("healthy");
            (Some(health), healthy)
        }
        (None, Some(service)) => {
            let health = service.health().await;
            let healthy = health.status == crate::editorial::HealthStatus::Healthy;
            (serde_json::to_value(health).ok(), healthy)
        }
        (None, None) => (None, false),
    };

    let (sequence_ready, registered_agents, persistence) = match &state.orchestration {
        Some(orchestration) => (
            orchestration.sequences.ready().await,
            orchestration.sequences.registered_agents(),
            Some(orchestration.sequences.persistence()),
        ),
        None => (false, Vec::new(), None),
    };

    let degraded = !editorial_healthy || (state.orchestration.is_some() && !sequence_ready);
    Json(json!({
        "status": if degraded { "degraded" } else { "healthy" },
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "role": state.role,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "registered_agents": registered_agents,
        "sequence_ready": sequence_ready,
        "persistence": persistence,
        "editorial": editorial,
    }))
}
