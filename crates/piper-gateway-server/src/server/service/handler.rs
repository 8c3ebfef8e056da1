//! HTTP handlers.

use crate::server::{
    service::orchestrator::{Artifact, Stage, SynthesisRequest, SynthesisService, report_failure},
    synthesis::{deliver::stream_body, runner::ProcessRunner},
    telemetry::increment_requests,
};
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{SecondsFormat, Utc};
use piper_gateway_core::{Error, Result};
use serde::{Deserialize, Serialize};

pub const SERVICE_LABEL: &str = "TTS API";

/// Largest request body accepted on `/synthesize`.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

// ============================================================================
// Health check
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    timestamp: String,
    service: &'static str,
    version: &'static str,
}

/// Liveness only: answers without touching the filesystem or the executable.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK",
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        service: SERVICE_LABEL,
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Index
// ============================================================================

#[derive(Debug, Serialize)]
pub struct Endpoints {
    health: &'static str,
    synthesize: &'static str,
}

#[derive(Debug, Serialize)]
pub struct IndexResponse {
    message: &'static str,
    endpoints: Endpoints,
}

pub async fn index() -> Json<IndexResponse> {
    Json(IndexResponse {
        message: "TTS API is running",
        endpoints: Endpoints {
            health: "/health",
            synthesize: "/synthesize (POST)",
        },
    })
}

// ============================================================================
// Synthesis
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct SynthesizeBody {
    #[serde(default)]
    pub text: Option<String>,
}

/// Turns whatever arrived as the request body into a validated request.
///
/// A body over [`MAX_BODY_BYTES`] is rejected as too large and a body that
/// could not be read at all gets its own message. Otherwise a body that is
/// absent, not JSON-typed, or carries no usable `text` is reported as missing
/// text, and only unparseable JSON is called out separately.
fn validate(
    body: core::result::Result<Json<SynthesizeBody>, JsonRejection>,
) -> Result<SynthesisRequest> {
    match body {
        Ok(Json(body)) => SynthesisRequest::new(body.text),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            Err(Error::PayloadTooLarge {
                limit: MAX_BODY_BYTES,
            })
        }
        Err(JsonRejection::BytesRejection(_)) => Err(Error::Validation {
            reason: "Could not read request body.".to_string(),
        }),
        Err(JsonRejection::JsonSyntaxError(_)) => Err(Error::Validation {
            reason: "Invalid JSON body.".to_string(),
        }),
        Err(_) => Err(Error::text_required()),
    }
}

/// `POST /synthesize`: `{"text": "..."}` in, `audio/wav` out.
#[tracing::instrument(skip_all, name = "synthesize")]
pub async fn synthesize<R: ProcessRunner>(
    State(service): State<SynthesisService<R>>,
    body: core::result::Result<Json<SynthesizeBody>, JsonRejection>,
) -> Result<Response> {
    increment_requests();

    let request = validate(body).inspect_err(|e| report_failure(Stage::Validating, e))?;
    let Artifact { workspace, len } = service.synthesize(request).await?;

    tracing::info!(
        stage = %Stage::Delivering,
        workspace = %workspace.id(),
        bytes = len,
        "Audio ready"
    );

    let headers = [
        (header::CONTENT_TYPE, HeaderValue::from_static("audio/wav")),
        (header::CONTENT_LENGTH, HeaderValue::from(len)),
    ];
    let body = stream_body(workspace, |id, outcome| match outcome {
        Ok(bytes) => {
            tracing::info!(stage = %Stage::Done, workspace = %id, bytes, "Delivered audio");
        }
        Err(e) => report_failure(Stage::Delivering, &e),
    });
    Ok((headers, body).into_response())
}
