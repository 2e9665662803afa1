//! Domain error types for the storage server.
//!
//! Uses thiserror for ergonomic error handling with automatic Display implementations.

use actix_web::{HttpResponse, ResponseError};
use std::fmt;

/// Application-level errors.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// No upload identifier in form field, header or query
    #[error("uploadId is required (form field, x-upload-id header or uploadId query parameter)")]
    MissingUploadId,

    /// File part MIME type is not on the allow-list
    #[error("Unsupported file type: {0}")]
    UnsupportedMediaType(String),

    /// File exceeded the configured maximum upload size
    #[error("File too large: exceeds maximum size of {max_bytes} bytes")]
    PayloadTooLarge { max_bytes: u64 },

    /// Blob store rejected or failed the transfer
    #[error("Upload failed: {0}")]
    UploadBackendFailure(String),

    /// Request body is not a usable multipart form
    #[error("Malformed multipart request: {0}")]
    MalformedMultipart(String),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Resource not found
    #[error("{0} not found")]
    NotFound(String),

    /// Invalid input data
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Storage (S3) operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Message queue operation failed
    #[error("Queue error: {0}")]
    Queue(String),
}

impl AppError {
    /// Machine-readable error code returned to clients.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::MissingUploadId => "MISSING_UPLOAD_ID",
            AppError::UnsupportedMediaType(_) => "UNSUPPORTED_MEDIA_TYPE",
            AppError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            AppError::UploadBackendFailure(_) => "UPLOAD_BACKEND_FAILURE",
            AppError::MalformedMultipart(_) => "MALFORMED_MULTIPART",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::Queue(_) => "QUEUE_ERROR",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;

        match self {
            AppError::MissingUploadId
            | AppError::PayloadTooLarge { .. }
            | AppError::MalformedMultipart(_)
            | AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::UploadBackendFailure(_)
            | AppError::Database(_)
            | AppError::Storage(_)
            | AppError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let response_message = match self {
            AppError::Database(err_str) => {
                tracing::error!("Database error: {}", err_str);
                "An internal database error occurred".to_string()
            }
            AppError::Queue(err_str) => {
                tracing::error!("Queue error: {}", err_str);
                "An internal messaging error occurred".to_string()
            }
            _ => self.to_string(),
        };

        HttpResponse::build(self.status_code()).json(ErrorResponse {
            status: false,
            error: self.code().to_string(),
            message: response_message,
        })
    }
}

/// Error response body matching OpenAPI schema.
#[derive(Debug, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    /// Always `false`
    pub status: bool,
    pub error: String,
    pub message: String,
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

// Conversion implementations for common error types

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

impl From<sea_orm::DbErr> for AppError {
    fn from(err: sea_orm::DbErr) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        AppError::InvalidInput(format!("Invalid UUID: {}", err))
    }
}
