//! Error handling for printwatch

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Capture device could not be opened or stopped yielding frames
    #[error("Device error: {0}")]
    Device(String),

    /// Inference backend failure
    #[error("Inference error: {0}")]
    Inference(String),

    /// Printer REST client failure
    #[error("Printer error: {0}")]
    Printer(String),

    /// Push notification failure
    #[error("Notification error: {0}")]
    Notification(String),

    /// Config file read/write failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decode/encode error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            Error::Device(_) => (StatusCode::SERVICE_UNAVAILABLE, "DEVICE_ERROR"),
            Error::Inference(_) => (StatusCode::BAD_GATEWAY, "INFERENCE_ERROR"),
            Error::Printer(_) => (StatusCode::BAD_GATEWAY, "PRINTER_ERROR"),
            Error::Notification(_) => (StatusCode::BAD_GATEWAY, "NOTIFICATION_ERROR"),
            Error::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "PERSISTENCE_ERROR"),
            Error::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            Error::Serialization(_) => (StatusCode::INTERNAL_SERVER_ERROR, "SERIALIZATION_ERROR"),
            Error::Http(_) => (StatusCode::BAD_GATEWAY, "HTTP_ERROR"),
            Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            Error::Image(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IMAGE_ERROR"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        let message = self.to_string();

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}
