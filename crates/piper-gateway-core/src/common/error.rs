//! Error types for the synthesis pipeline.
//!
//! This module defines the central `Error` enum, which captures every
//! reportable failure between receiving a `/synthesize` request and handing
//! the audio back. It implements [`IntoResponse`] so handlers can return it
//! directly; the response carries a status code and a short message, never
//! internal detail such as file paths or the executable's diagnostics.
//!
//! ## Error Cases
//! - `Validation`: The request had no usable text (client fault, 400).
//! - `PayloadTooLarge`: The request body exceeded the size limit (413).
//! - `StorageUnavailable`: No workspace could be allocated (500).
//! - `SynthesisUnavailable`: The executable could not be launched (500).
//! - `SynthesisFailed`: The executable ran but did not produce audio (500).
//! - `Delivery`: Streaming the artifact to the caller failed. Only logged.
//! - `ServiceShutdown`: A request arrived while the service was draining.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the synthesis pipeline.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The request body was missing, malformed, or had empty text.
    #[error("Invalid request: {reason}")]
    Validation { reason: String },

    /// The request body was larger than the server accepts.
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// The output directory could not be created or written to.
    #[error("Storage unavailable: {context}")]
    StorageUnavailable { context: String },

    /// The synthesis executable is missing or cannot be executed.
    #[error("Synthesis unavailable: {context}")]
    SynthesisUnavailable { context: String },

    /// The synthesis executable ran but failed. `stderr` holds whatever the
    /// process wrote to its error stream, for server-side logs.
    #[error("Synthesis failed: {context}")]
    SynthesisFailed { context: String, stderr: String },

    /// The artifact could not be streamed to the caller.
    #[error("Delivery error: {context}")]
    Delivery { context: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// Message returned when a request carries no text.
    pub const TEXT_REQUIRED: &'static str = "Text is required.";

    /// Shorthand for the most common validation failure.
    pub fn text_required() -> Self {
        Self::Validation {
            reason: Self::TEXT_REQUIRED.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ServiceShutdown => StatusCode::SERVICE_UNAVAILABLE,
            Self::StorageUnavailable { .. }
            | Self::SynthesisUnavailable { .. }
            | Self::SynthesisFailed { .. }
            | Self::Delivery { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The caller-facing message. Validation reasons are the caller's own
    /// input problem and are returned as-is; everything else is generic.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation { reason } => reason.clone(),
            Self::PayloadTooLarge { .. } => "Request body too large.".to_string(),
            Self::StorageUnavailable { .. } => "Temporary storage unavailable.".to_string(),
            Self::SynthesisUnavailable { .. } | Self::SynthesisFailed { .. } => {
                "TTS synthesis failed.".to_string()
            }
            Self::Delivery { .. } => "Failed to deliver audio.".to_string(),
            Self::ServiceShutdown => "Service is shutting down.".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status_code(), self.public_message()).into_response()
    }
}
