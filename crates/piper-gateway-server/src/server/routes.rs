//! Router assembly.

use crate::server::{
    service::{
        handler::{MAX_BODY_BYTES, health, index, synthesize},
        orchestrator::SynthesisService,
    },
    synthesis::runner::ProcessRunner,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub fn create_router<R: ProcessRunner>(service: SynthesisService<R>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/synthesize", post(synthesize::<R>))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}
