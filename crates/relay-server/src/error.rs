use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use relay_core::RelayError;

/// Failure of an HTTP command, rendered as `{success: false, error: {...}}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidParams(String),

    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("{0}")]
    NoData(String),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Wire shape of the `error` object.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParams(_) => "INVALID_PARAMS",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NoData(_) => "NO_DATA",
            Self::Relay(RelayError::NoClients) => "NO_CLIENTS",
            Self::Relay(RelayError::Timeout(_)) => "TIMEOUT",
            Self::Relay(RelayError::Rejected(_)) => "REMOTE_REJECTED",
            Self::Relay(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidParams(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NoData(_) => StatusCode::NOT_FOUND,
            Self::Relay(RelayError::NoClients) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Relay(RelayError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Self::Relay(RelayError::Rejected(_)) => StatusCode::BAD_GATEWAY,
            Self::Relay(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
            retryable: matches!(self, Self::Relay(e) if e.is_retryable()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(code = self.code(), error = %self, "command failed");
        }
        let body = serde_json::json!({ "success": false, "error": self.body() });
        (status, Json(body)).into_response()
    }
}
