//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the realtime API, SSE stream, and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        AudioPayload, CommitResponse, ErrorResponse, HealthResponse, OkResponse, RootResponse,
        SdpPayload, SessionPayload, StartPayload, StartResponse, StatusResponse, TextPayload,
    },
    state::AppState,
};

use anyhow::Context;
use axum::{
    Router,
    http::HeaderValue,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::root,
        handlers::health,
        handlers::start_session,
        handlers::append_audio,
        handlers::commit_audio,
        handlers::send_text,
        handlers::stream_events,
        handlers::stop_session,
        handlers::session_status,
        handlers::negotiate_sdp,
    ),
    components(
        schemas(
            StartPayload, StartResponse, AudioPayload, SessionPayload, TextPayload, SdpPayload,
            OkResponse, CommitResponse, StatusResponse, ErrorResponse, RootResponse, HealthResponse
        )
    ),
    tags(
        (name = "Podcast Studio Realtime API", description = "Browser bridge to the realtime voice provider")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let realtime = Router::new()
        .route("/start", post(handlers::start_session))
        .route("/audio", post(handlers::append_audio))
        .route("/commit", post(handlers::commit_audio))
        .route("/text", post(handlers::send_text))
        .route("/events", get(handlers::stream_events))
        .route("/stop", post(handlers::stop_session))
        .route("/status", get(handlers::session_status))
        .route("/sdp", post(handlers::negotiate_sdp));

    let api_router = Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .nest("/api/realtime", realtime)
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}

/// CORS for the browser client. `*` allows any origin.
pub fn cors_layer(allowed_origin: &str) -> anyhow::Result<CorsLayer> {
    let origin = if allowed_origin.trim() == "*" {
        AllowOrigin::any()
    } else {
        let origin = allowed_origin
            .parse::<HeaderValue>()
            .with_context(|| format!("Invalid ALLOWED_ORIGIN: {allowed_origin}"))?;
        AllowOrigin::exact(origin)
    };
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any))
}
