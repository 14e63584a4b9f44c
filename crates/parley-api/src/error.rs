//! Structured HTTP error bodies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use parley_types::error::{ErrorKind, ParleyError};

/// A [`ParleyError`] rendered as `{ kind, message, details }` with a status
/// code matching its kind.
#[derive(Debug)]
pub struct ApiError(pub ParleyError);

impl From<ParleyError> for ApiError {
    fn from(e: ParleyError) -> Self {
        Self(e)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// HTTP status for an error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::ToolUnauthorized => StatusCode::FORBIDDEN,
        ErrorKind::SessionInvalid | ErrorKind::NoRoute => StatusCode::NOT_FOUND,
        ErrorKind::SessionClosed => StatusCode::GONE,
        ErrorKind::ProtocolMismatch => StatusCode::CONFLICT,
        ErrorKind::MissingRequiredCapability => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ToolValidationError
        | ErrorKind::InvalidCapability
        | ErrorKind::InvalidInput
        | ErrorKind::Serialization => StatusCode::BAD_REQUEST,
        ErrorKind::ToolExecutionError | ErrorKind::DeliveryFailed => StatusCode::BAD_GATEWAY,
        ErrorKind::ToolTimeout | ErrorKind::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Config | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = self.0.to_body();
        let status = status_for(body.kind);
        if status.is_server_error() {
            tracing::warn!(kind = ?body.kind, error = %body.message, "Request failed");
        } else {
            tracing::debug!(kind = ?body.kind, error = %body.message, "Request rejected");
        }
        (status, Json(body)).into_response()
    }
}
