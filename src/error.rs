//! Unified HTTP error type for axum request handlers.
//!
//! [`AppError`] wraps [`anyhow::Error`] plus a semantic `code` and converts
//! it into the normalized `{error:{message,type,code}}` body shape via
//! [`IntoResponse`]. Handlers return `Result<T, AppError>` and propagate
//! with `?`; the status defaults to `500 internal_error` unless a more
//! specific status/code pair is attached with [`AppError::with_status`].

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Wraps [`anyhow::Error`] so it can be returned from axum handlers.
#[derive(Debug)]
pub struct AppError {
    inner: anyhow::Error,
    status: StatusCode,
    code: &'static str,
}

impl AppError {
    /// Attach an explicit HTTP status and semantic error code.
    pub fn with_status(mut self, status: StatusCode, code: &'static str) -> Self {
        self.status = status;
        self.code = code;
        self
    }

    pub fn unauthorized(msg: impl std::fmt::Display) -> Self {
        Self::from(anyhow::anyhow!("{msg}")).with_status(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    pub fn bad_request(msg: impl std::fmt::Display) -> Self {
        Self::from(anyhow::anyhow!("{msg}")).with_status(StatusCode::BAD_REQUEST, "invalid_request")
    }

    pub fn not_found(msg: impl std::fmt::Display) -> Self {
        Self::from(anyhow::anyhow!("{msg}")).with_status(StatusCode::NOT_FOUND, "not_found")
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self.inner, code = self.code, "handler error");
        (
            self.status,
            Json(json!({
                "error": {
                    "message": self.inner.to_string(),
                    "type": "proxy_error",
                    "code": self.code,
                }
            })),
        )
            .into_response()
    }
}

/// Convert any `Into<anyhow::Error>` into an [`AppError`] defaulting to a
/// `500 internal_error` — the fail-open path surfaces this only when even
/// the original-model fallback dispatch has failed.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self {
            inner: e.into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
        }
    }
}
