//! # Error Handling
//!
//! This module defines the request-level error taxonomy and how each error is
//! turned into an HTTP response.
//!
//! ## Error Categories:
//! - **Unauthorized**: missing or wrong `X-API-KEY` (401). The client can
//!   resubmit with the right credentials.
//! - **BadRequest**: the multipart body carried no usable audio part (400)
//! - **ModelUnavailable**: the speech model could not be loaded (500). The
//!   next request retries the load.
//! - **TranscriptionFailed**: the engine rejected or failed on the audio (500)
//!
//! ## Response format:
//! ```json
//! {
//!   "detail": "Model unavailable: device unavailable",
//!   "type": "model_unavailable",
//!   "timestamp": "2025-01-01T12:00:00Z"
//! }
//! ```
//!
//! Messages carry only the top-level reason. Full error chains and the
//! correlation id go to the server log, never into a response body.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Caller did not present the configured API token
    Unauthorized(String),

    /// Client sent a request the service cannot work with
    BadRequest(String),

    /// Model loading failed
    ModelUnavailable(String),

    /// Inference failed, including undecodable audio
    TranscriptionFailed(String),
}

impl AppError {
    fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => "unauthorized",
            AppError::BadRequest(_) => "bad_request",
            AppError::ModelUnavailable(_) => "model_unavailable",
            AppError::TranscriptionFailed(_) => "transcription_failed",
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ModelUnavailable(msg) => write!(f, "Model unavailable: {}", msg),
            AppError::TranscriptionFailed(msg) => write!(f, "Transcription failed: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::ModelUnavailable(_) | AppError::TranscriptionFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "detail": self.to_string(),
            "type": self.kind(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))
    }
}

/// Multipart stream failures are caused by the client's upload.
impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("Multipart error: {}", err))
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
