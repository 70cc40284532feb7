//! Job error taxonomy and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

/// Why a job did not produce a document.
///
/// Every variant is terminal for the request; nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("No file uploaded or the file is empty")]
    EmptyUpload,

    #[error("Malformed upload: {0}")]
    Upload(String),

    #[error("Upload exceeds the size limit")]
    UploadTooLarge,

    #[error("{file_name} is not a PDF document")]
    NotPdf { file_name: String },

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("{program} could not be started: {source}")]
    EngineUnavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{}", processing_failed_message(.program, .exit_code, .reason))]
    ProcessingFailed {
        program: String,
        exit_code: Option<i32>,
        reason: String,
        stderr: String,
    },

    #[error("{program} did not finish within {seconds} seconds")]
    Timeout { program: String, seconds: u64 },

    #[error("The server is shutting down")]
    ShuttingDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn processing_failed_message(program: &str, exit_code: &Option<i32>, reason: &str) -> String {
    match exit_code {
        Some(code) => format!("{} failed with exit code {}: {}", program, code, reason),
        None => format!("{} failed: {}", program, reason),
    }
}

impl JobError {
    /// Short machine-readable tag used in JSON bodies and the UI.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyUpload => "empty_upload",
            Self::Upload(_) => "upload",
            Self::UploadTooLarge => "upload_too_large",
            Self::NotPdf { .. } => "not_pdf",
            Self::InvalidOptions(_) => "invalid_options",
            Self::EngineUnavailable { .. } => "engine_unavailable",
            Self::ProcessingFailed { .. } => "processing_failed",
            Self::Timeout { .. } => "timeout",
            Self::ShuttingDown => "shutting_down",
            Self::Io(_) => "io",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::EmptyUpload | Self::Upload(_) | Self::InvalidOptions(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::UploadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotPdf { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::EngineUnavailable { .. } | Self::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::ProcessingFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for errors raised before any subprocess was started.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyUpload
                | Self::Upload(_)
                | Self::UploadTooLarge
                | Self::NotPdf { .. }
                | Self::InvalidOptions(_)
        )
    }

    pub fn body(&self) -> ErrorBody {
        let (exit_code, stderr) = match self {
            Self::ProcessingFailed {
                exit_code, stderr, ..
            } => (*exit_code, Some(stderr.clone())),
            _ => (None, None),
        };
        ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
            exit_code,
            stderr,
        }
    }
}

/// JSON error payload returned to the browser.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.body())).into_response()
    }
}
