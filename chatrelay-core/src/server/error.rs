//! HTTP rendering of `RelayError`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::error::RelayError;

use super::TRACING_TARGET;

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    /// Raw upstream payload, when it explains the failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MessageFormat(_) => StatusCode::BAD_REQUEST,
            Self::MissingCredential { .. } | Self::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::HttpStatus { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(target: TRACING_TARGET, error = %self, kind = self.kind(), "request failed");
        }
        let error = self.client_message();
        let detail = match self {
            Self::Submit { detail, .. } => detail,
            _ => None,
        };
        (status, Json(ErrorBody { error, detail })).into_response()
    }
}
