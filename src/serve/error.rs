use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::ExecutionError;
use crate::prelude::*;

/// Wrapper that maps the core error taxonomy onto HTTP responses.
///
/// User errors are surfaced verbatim; system and data errors are logged in
/// full but presented to the caller as an opaque code.
pub struct ApiError(pub ExecutionError);

impl From<ExecutionError> for ApiError {
    fn from(item: ExecutionError) -> Self {
        ApiError(item)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();

        let status = match code {
            "missing_parameter" | "invalid_parameter" => StatusCode::BAD_REQUEST,
            "not_authenticated" => StatusCode::UNAUTHORIZED,
            "forbidden_override" | "user_agent_mismatch" | "ip_prefix_mismatch" => {
                StatusCode::FORBIDDEN
            }
            "route_not_found" | "invalid_token" => StatusCode::NOT_FOUND,
            "share_expired" | "share_used" => StatusCode::GONE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match self.0.is_user() {
            true => self.0.to_string(),
            false => {
                error!("Request failed [{code}]: {}", self.0);
                String::from("internal error")
            }
        };

        let body = Json(serde_json::json!({
            "code": code,
            "message": message,
        }));

        (status, body).into_response()
    }
}
