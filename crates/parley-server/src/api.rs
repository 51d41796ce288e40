//! HTTP handlers for session control and audio input.

use crate::AppState;
use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parley_engine::{EngineError, NoncomplianceEvent, RegistryError, SessionInfo, StartOptions};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

/// Request body for `POST /session/start`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartSessionRequest {
    pub system_prompt: Option<String>,
    pub user_id: Option<String>,
    /// History session to recover the conversation from.
    pub recover_from: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub voice_id: Option<String>,
}

impl From<StartSessionRequest> for StartOptions {
    fn from(req: StartSessionRequest) -> Self {
        Self {
            system_prompt: req.system_prompt,
            user_id: req.user_id,
            recover_from: req.recover_from,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            top_p: req.top_p,
            voice_id: req.voice_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub history_session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AudioChunkRequest {
    pub session_id: String,
    /// Base64 PCM.
    pub audio_data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AudioChunkResponse {
    pub status: String,
    pub bytes_sent: usize,
}

#[derive(Debug, Deserialize)]
pub struct SessionRef {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct SessionAuditResponse {
    pub session_id: String,
    pub noncompliance_events: Vec<NoncomplianceEvent>,
}

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Closed | EngineError::AlreadySubscribed => {
                ApiError::Conflict(err.to_string())
            }
            other => ApiError::InternalServerError(other.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AtCapacity { .. } | RegistryError::ShuttingDown => {
                ApiError::ServiceUnavailable(err.to_string())
            }
            RegistryError::NotFound(id) => ApiError::NotFound(format!("session {id}")),
            RegistryError::Engine(e) => e.into(),
        }
    }
}

/// Maps an engine call's error. An engine that was closed because its
/// session was ended or reaped while the request was in flight reads as a
/// missing session rather than a conflict.
pub(crate) async fn engine_call<T>(
    state: &AppState,
    session_id: &str,
    result: Result<T, EngineError>,
) -> Result<T, ApiError> {
    match result {
        Err(EngineError::Closed) if state.registry.get(session_id).await.is_err() => {
            Err(ApiError::NotFound(format!("session {session_id}")))
        }
        other => other.map_err(ApiError::from),
    }
}

/// Handler for `POST /session/start`.
pub async fn start_session_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<StartSessionRequest>,
) -> Result<Json<StartSessionResponse>, ApiError> {
    let engine = state.registry.create(payload.into()).await?;
    let info = engine.info();
    Ok(Json(StartSessionResponse {
        session_id: info.session_id,
        status: "started".to_string(),
        created_at: info.created_at,
        history_session_id: info.history_session_id,
    }))
}

/// Handler for `POST /audio/chunk`.
pub async fn audio_chunk_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<AudioChunkRequest>,
) -> Result<Json<AudioChunkResponse>, ApiError> {
    let pcm = base64::engine::general_purpose::STANDARD
        .decode(payload.audio_data.as_bytes())
        .map_err(|e| ApiError::BadRequest(format!("audio_data is not valid base64: {e}")))?;

    let engine = state.registry.get(&payload.session_id).await?;
    engine_call(&state, &payload.session_id, engine.add_audio_chunk(&pcm)).await?;
    Ok(Json(AudioChunkResponse {
        status: "ok".to_string(),
        bytes_sent: pcm.len(),
    }))
}

/// Handler for `POST /audio/start`. Opening an already open block is a no-op.
pub async fn audio_start_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<SessionRef>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.registry.get(&payload.session_id).await?;
    engine_call(&state, &payload.session_id, engine.start_audio_content()).await?;
    Ok(Json(json!({ "status": "audio_started" })))
}

/// Handler for `POST /audio/end`.
pub async fn audio_end_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<SessionRef>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.registry.get(&payload.session_id).await?;
    engine_call(&state, &payload.session_id, engine.end_audio_content()).await?;
    Ok(Json(json!({ "status": "audio_ended" })))
}

/// Handler for `POST /session/{id}/next-turn`.
pub async fn next_turn_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.registry.get(&session_id).await?;
    let prepared = engine.prepare_for_next_turn().await;
    engine_call(&state, &session_id, prepared).await?;
    Ok(Json(json!({ "status": "ready", "session_id": session_id })))
}

/// Handler for `DELETE /session/{id}`.
pub async fn end_session_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.registry.end_session(&session_id).await {
        return Err(ApiError::NotFound(format!("session {session_id}")));
    }
    Ok(Json(json!({ "status": "ended", "session_id": session_id })))
}

/// Handler for `GET /session/{id}/info`.
pub async fn session_info_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    Ok(Json(state.registry.info(&session_id).await?))
}

/// Handler for `GET /admin/audit/session/{id}`: the assistant fragments the
/// compliance filter blocked in this session.
pub async fn session_audit_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionAuditResponse>, ApiError> {
    let engine = state.registry.get(&session_id).await?;
    Ok(Json(SessionAuditResponse {
        noncompliance_events: engine.noncompliance_events(),
        session_id,
    }))
}
