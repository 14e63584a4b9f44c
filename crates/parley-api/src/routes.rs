//! Route handlers for the parley HTTP API.

use crate::error::{ApiError, ApiResult};
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use parley_kernel::{Coordinator, CoordinatorHealth};
use parley_types::agent::{AgentCard, DiscoverRequest};
use parley_types::capability::Capability;
use parley_types::envelope::MessageRequest;
use parley_types::error::ParleyError;
use parley_types::negotiation::{NegotiationRequest, NegotiationResponse};
use parley_types::notification::NotifyRequest;
use parley_types::session::Session;
use parley_types::tool::{ExecuteToolRequest, ToolDescriptor, ToolResult};
use std::sync::Arc;

/// Shared state for every handler.
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

/// Bearer token from an `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// The session behind the request's bearer token. Rejects with 401.
pub struct Authed(pub Session);

impl FromRequestParts<Arc<AppState>> for Authed {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or_else(|| {
            ParleyError::Unauthorized("missing bearer token".to_string())
        })?;
        let session = state.coordinator.authenticate(token)?;
        Ok(Authed(session))
    }
}

/// Unwrap a JSON body, turning a malformed one into a structured error.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ApiError(ParleyError::InvalidInput(e.body_text())))
}

/// GET /.well-known/agent-card
pub async fn agent_card(State(state): State<Arc<AppState>>) -> Json<AgentCard> {
    Json(AgentCard::clone(&state.coordinator.registry.describe()))
}

/// POST /discover
pub async fn discover(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DiscoverRequest>, JsonRejection>,
) -> ApiResult<Json<Vec<Capability>>> {
    let req = body(payload)?;
    Ok(Json(
        state
            .coordinator
            .discovery
            .discover(&req.requester_id, req.filter.as_deref()),
    ))
}

/// POST /negotiate
pub async fn negotiate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NegotiationRequest>, JsonRejection>,
) -> ApiResult<Json<NegotiationResponse>> {
    let req = body(payload)?;
    Ok(Json(state.coordinator.engine.negotiate(req)?))
}

/// POST /message
///
/// 200 with the correlated reply when `await_response` is set, otherwise
/// 202 once the envelope is queued.
pub async fn message(
    State(state): State<Arc<AppState>>,
    Authed(session): Authed,
    payload: Result<Json<MessageRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let req = body(payload)?;
    match state.coordinator.handle_message(&session, req).await? {
        Some(reply) => Ok(Json(reply).into_response()),
        None => Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"status": "accepted"})),
        )
            .into_response()),
    }
}

/// POST /notify
pub async fn notify(
    State(state): State<Arc<AppState>>,
    Authed(session): Authed,
    payload: Result<Json<NotifyRequest>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let req = body(payload)?;
    Ok(Json(state.coordinator.handle_notify(&session, req)?))
}

/// GET /tools
pub async fn list_tools(
    State(state): State<Arc<AppState>>,
    Authed(session): Authed,
) -> ApiResult<Json<Vec<ToolDescriptor>>> {
    Ok(Json(state.coordinator.bridge.list_tools(session.id).await?))
}

/// POST /tools/execute
pub async fn execute_tool(
    State(state): State<Arc<AppState>>,
    Authed(session): Authed,
    payload: Result<Json<ExecuteToolRequest>, JsonRejection>,
) -> ApiResult<Json<ToolResult>> {
    let req = body(payload)?;
    let result = state
        .coordinator
        .bridge
        .execute_tool(session.id, &req.tool, req.args)
        .await?;
    Ok(Json(result))
}

/// POST /session/revoke: log out the calling session.
pub async fn revoke_session(
    State(state): State<Arc<AppState>>,
    Authed(session): Authed,
) -> ApiResult<Json<serde_json::Value>> {
    let revoked = state.coordinator.revoke(session.id)?;
    Ok(Json(serde_json::json!({
        "session_id": session.id,
        "revoked": revoked,
    })))
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<CoordinatorHealth> {
    Json(state.coordinator.health())
}
