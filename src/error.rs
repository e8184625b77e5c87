//! # Error Handling
//!
//! Every failure the server can produce is an [`AppError`]. The same value is
//! rendered two ways:
//!
//! - **HTTP**: through actix's `ResponseError` trait, as a JSON body with a
//!   matching status code (used by `/health` and the channel handshake).
//! - **Event channel**: as the payload of a `response_error` event, so a client
//!   whose conversion failed gets a structured answer instead of a dropped
//!   connection.
//!
//! ## Error Categories:
//! - **Validation**: the request itself is malformed (400)
//! - **Device**: the requested accelerator is out of range or cannot be opened (400)
//! - **Inference**: the model or the tensor pipeline failed (500)
//! - **Io**: filesystem problems (certificates, dumps, model files) (500)
//! - **Config**: configuration could not be loaded or is invalid (500)
//! - **Protocol**: an Engine.IO / Socket.IO packet could not be decoded (400)
//! - **Internal**: everything else (500)

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::Validation("payload length must be even".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Client sent a request that cannot be converted
    Validation(String),

    /// Requested accelerator index is invalid or the device failed to open
    Device(String),

    /// Model or tensor failure during conversion
    Inference(String),

    /// Filesystem failure
    Io(String),

    /// Configuration file, environment variable or flag problems
    Config(String),

    /// Undecodable transport packet
    Protocol(String),

    /// Anything that does not fit the categories above
    Internal(String),
}

impl AppError {
    /// Stable, machine-readable name of the error category.
    ///
    /// This is what clients switch on; the message text is for humans and
    /// may change between releases.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::Device(_) => "device_error",
            AppError::Inference(_) => "inference_error",
            AppError::Io(_) => "io_error",
            AppError::Config(_) => "config_error",
            AppError::Protocol(_) => "protocol_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// The message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            AppError::Validation(msg)
            | AppError::Device(msg)
            | AppError::Inference(msg)
            | AppError::Io(msg)
            | AppError::Config(msg)
            | AppError::Protocol(msg)
            | AppError::Internal(msg) => msg,
        }
    }

    /// Body of the `response_error` event sent back over the event channel.
    pub fn to_event_payload(&self) -> serde_json::Value {
        json!({
            "type": self.kind(),
            "message": self.message(),
        })
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
            AppError::Device(msg) => write!(f, "Device error: {}", msg),
            AppError::Inference(msg) => write!(f, "Inference error: {}", msg),
            AppError::Io(msg) => write!(f, "I/O error: {}", msg),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// HTTP rendering.
///
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "payload length 3 is not a multiple of 2",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::Device(_) | AppError::Protocol(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Inference(_)
            | AppError::Io(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// When you use `?` with an anyhow::Error, it becomes an AppError::Internal.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

/// JSON errors come from clients sending malformed event payloads, so they
/// are treated as protocol errors rather than server faults.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Protocol(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<candle_core::Error> for AppError {
    fn from(err: candle_core::Error) -> Self {
        AppError::Inference(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
