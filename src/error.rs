use axum::{
    Json,
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorFormat {
    Json,
    Text,
}

/// Handler-boundary error. Missing sessions and files answer with a short
/// text reason; everything else carries the same `{success, message}` shape
/// the page already knows how to render.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    format: ErrorFormat,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            format: ErrorFormat::Json,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            format: ErrorFormat::Text,
        }
    }

    pub fn session_expired() -> Self {
        Self::not_found("Session expired")
    }

    pub fn file_missing() -> Self {
        Self::not_found("File not found")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            format: ErrorFormat::Json,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.format {
            ErrorFormat::Text => (
                self.status,
                [(CONTENT_TYPE, "text/plain; charset=utf-8")],
                self.message,
            )
                .into_response(),
            ErrorFormat::Json => {
                let body = Json(ErrorBody {
                    success: false,
                    message: self.message,
                });
                (self.status, body).into_response()
            }
        }
    }
}
