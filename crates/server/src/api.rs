use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use parley_agent::executor::ToolCallStatus;
use parley_agent::{AgentRuntime, ChatReply, ChatRequest, ReplyStatus, SessionStoreError, SessionSummary};
use parley_core::domain::conversation::SessionId;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Clone)]
pub struct ApiState {
    runtime: Arc<AgentRuntime>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChatBody {
    pub session_id: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ToolCallBody {
    pub name: String,
    pub status: ToolCallStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatResponse {
    pub response_text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallBody>,
    pub status: ReplyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    pub correlation_id: String,
}

impl From<ChatReply> for ChatResponse {
    fn from(reply: ChatReply) -> Self {
        Self {
            response_text: reply.response_text,
            input_tokens: reply.input_tokens,
            output_tokens: reply.output_tokens,
            tool_call: reply.tool_call.map(|call| ToolCallBody { name: call.name, status: call.status }),
            status: reply.status,
            reason_code: reply.reason_code,
            correlation_id: reply.correlation_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClearedSession {
    pub session_id: String,
    pub cleared: bool,
}

type ApiError = (StatusCode, Json<ErrorBody>);

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub provider: String,
    pub tools: usize,
    pub guardrail_mode: &'static str,
    pub checked_at: String,
}

pub fn router(runtime: Arc<AgentRuntime>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/chat", post(chat))
        .route("/api/v1/chat/session/{session_id}", get(session_info).delete(clear_session))
        .with_state(ApiState { runtime })
}

/// Serves the API until `shutdown` resolves, then drains open connections.
pub async fn serve<F>(listener: TcpListener, runtime: Arc<AgentRuntime>, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let address = listener.local_addr()?;
    info!(
        event_name = "system.api.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "chat API listening"
    );
    axum::serve(listener, router(runtime)).with_graceful_shutdown(shutdown).await
}

pub async fn health(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let guardrails = state.runtime.guardrails().snapshot();
    let payload = HealthResponse {
        status: "ready",
        provider: state.runtime.provider_id().to_string(),
        tools: state.runtime.registry().len(),
        guardrail_mode: guardrails.mode.as_str(),
        checked_at: Utc::now().to_rfc3339(),
    };
    (StatusCode::OK, Json(payload))
}

pub async fn chat(
    State(state): State<ApiState>,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(body) = body.map_err(|rejection| {
        warn!(
            event_name = "api.chat.malformed_body",
            correlation_id = "unassigned",
            error = %rejection,
            "chat request body rejected"
        );
        bad_request("request body must be JSON with `session_id` and `message` strings")
    })?;

    let session_id = valid_session_id(&body.session_id)?;
    let reply = state.runtime.handle(ChatRequest { session_id, message: body.message }).await;

    if reply.status == ReplyStatus::Failed {
        let status = match reply.reason_code.as_deref() {
            Some("service_unavailable") => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        return Err((
            status,
            Json(ErrorBody {
                error: reply.reason_code.unwrap_or_else(|| "internal_error".to_string()),
                message: reply.response_text,
            }),
        ));
    }

    Ok(Json(ChatResponse::from(reply)))
}

pub async fn session_info(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    let session_id = valid_session_id(&session_id)?;
    match state.runtime.session_summary(&session_id).await {
        Ok(Some(summary)) => Ok(Json(summary)),
        Ok(None) => Err(session_not_found()),
        Err(error) => Err(store_unavailable(&session_id, &error)),
    }
}

pub async fn clear_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<ClearedSession>, ApiError> {
    let session_id = valid_session_id(&session_id)?;
    match state.runtime.clear_session(&session_id).await {
        Ok(true) => Ok(Json(ClearedSession { session_id: session_id.0, cleared: true })),
        Ok(false) => Err(session_not_found()),
        Err(error) => Err(store_unavailable(&session_id, &error)),
    }
}

fn valid_session_id(raw: &str) -> Result<SessionId, ApiError> {
    let session_id = raw.trim();
    if session_id.is_empty() || session_id.chars().count() > MAX_SESSION_ID_LEN {
        return Err(bad_request("`session_id` must be between 1 and 128 characters"));
    }
    Ok(SessionId::from(session_id))
}

fn bad_request(message: &str) -> ApiError {
    error_response(StatusCode::BAD_REQUEST, "invalid_request", message)
}

fn session_not_found() -> ApiError {
    error_response(StatusCode::NOT_FOUND, "session_not_found", "No history is stored for this session.")
}

fn store_unavailable(session_id: &SessionId, error: &SessionStoreError) -> ApiError {
    warn!(
        event_name = "api.session.store_unavailable",
        correlation_id = "unassigned",
        session_id = %session_id,
        error = %error,
        "session store request failed"
    );
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "service_unavailable",
        "The service is temporarily unavailable. Please retry shortly.",
    )
}

fn error_response(status: StatusCode, error: &str, message: &str) -> ApiError {
    (status, Json(ErrorBody { error: error.to_string(), message: message.to_string() }))
}
