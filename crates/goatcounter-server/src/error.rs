use std::collections::BTreeMap;

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors that map directly to HTTP responses.
///
/// Handlers return `Result<impl IntoResponse, AppError>`; the body is
/// `{"error": "…"}` except for [`AppError::HitErrors`], which lists the
/// offending hit indexes.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    /// Per-index validation errors for the batch API.
    #[error("invalid hits")]
    HitErrors(BTreeMap<usize, String>),

    #[error("path too long")]
    UriTooLong,

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("rate limited")]
    RateLimited {
        limit: u32,
        remaining: u32,
        reset_secs: u64,
    },

    #[error("{0}")]
    Overloaded(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

fn set_header(response: &mut Response, name: &'static str, value: impl ToString) {
    if let Ok(v) = HeaderValue::from_str(&value.to_string()) {
        response.headers_mut().insert(name, v);
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::HitErrors(_) => StatusCode::BAD_REQUEST,
            AppError::UriTooLong => StatusCode::URI_TOO_LONG,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let AppError::Internal(e) = &self {
            tracing::error!(error = %e, "internal error");
        }

        let body = match &self {
            AppError::HitErrors(errs) => {
                let errs: serde_json::Map<String, serde_json::Value> = errs
                    .iter()
                    .map(|(i, msg)| (i.to_string(), json!(msg)))
                    .collect();
                json!({ "errors": errs })
            }
            AppError::Internal(_) => json!({ "error": "internal server error" }),
            other => json!({ "error": other.to_string() }),
        };

        let mut response = (status, Json(body)).into_response();
        if let AppError::RateLimited {
            limit,
            remaining,
            reset_secs,
        } = self
        {
            set_header(&mut response, "x-rate-limit-limit", limit);
            set_header(&mut response, "x-rate-limit-remaining", remaining);
            set_header(&mut response, "x-rate-limit-reset", reset_secs);
            set_header(&mut response, "retry-after", reset_secs);
        }
        response
    }
}
