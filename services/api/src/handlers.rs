//! Axum Handlers for the realtime API
//!
//! Each handler is a thin adapter over one `RealtimeManager` call. Failures are
//! reported through [`ApiError`], which keeps the manager's stable error code
//! and picks the HTTP status from it.

use axum::{
    extract::{Query, State},
    http::{StatusCode, header},
    response::{
        IntoResponse, Json, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use futures_util::{Stream, StreamExt};
use secrecy::SecretString;
use std::{str::FromStr, sync::Arc};
use studio_realtime::{ErrorKind, EventKind, Provider, RealtimeError, StartRequest};
use tracing::{error, info, warn};

use crate::{
    models::{
        AudioPayload, CommitResponse, ErrorResponse, EventsQuery, HealthResponse, OkResponse,
        RootResponse, SdpPayload, SessionPayload, SessionQuery, StartPayload, StartResponse,
        StatusResponse, TextPayload, session_id_or_default,
    },
    state::AppState,
};

#[derive(Debug)]
pub struct ApiError(pub RealtimeError);

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::InvalidConfiguration
            | ErrorKind::InvalidInput
            | ErrorKind::MissingCredential
            | ErrorKind::UnsupportedProvider => StatusCode::BAD_REQUEST,
            ErrorKind::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            ErrorKind::SessionNotReady => StatusCode::CONFLICT,
            ErrorKind::BadGateway => StatusCode::BAD_GATEWAY,
            ErrorKind::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::HandshakeTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::InternalFailure => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let err = self.0;
        let message = match &err {
            RealtimeError::InternalFailure(detail) => {
                error!("Internal Server Error: {}", detail);
                "An internal server error occurred.".to_string()
            }
            other => {
                warn!(code = %other.kind(), "Request failed: {}", other);
                other.to_string()
            }
        };
        let body = ErrorResponse {
            error: err.kind().as_str().to_string(),
            message,
            status: err.session_status().map(|s| s.to_string()),
            retryable: err.session_status().map(|_| err.is_retryable()),
        };
        (status, Json(body)).into_response()
    }
}

impl From<RealtimeError> for ApiError {
    fn from(err: RealtimeError) -> Self {
        Self(err)
    }
}

fn parse_provider(provider: Option<&str>) -> Result<Option<Provider>, ApiError> {
    Ok(provider
        .filter(|p| !p.trim().is_empty())
        .map(Provider::from_str)
        .transpose()?)
}

fn secret(api_key: Option<String>) -> Option<SecretString> {
    api_key
        .filter(|k| !k.trim().is_empty())
        .map(SecretString::from)
}

fn parse_kinds(kinds: Option<&str>) -> Result<Vec<EventKind>, ApiError> {
    let Some(kinds) = kinds else {
        return Ok(Vec::new());
    };
    Ok(kinds
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(EventKind::from_str)
        .collect::<Result<Vec<_>, _>>()?)
}

/// Service banner.
#[utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Service is running", body = RootResponse))
)]
pub async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Podcast Studio API is running".to_string(),
    })
}

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        default_model: state.config.realtime_model.clone(),
        credential_configured: state.config.openai_api_key.is_some(),
    })
}

/// Configure and start a realtime session, or join a start already in flight.
#[utoipa::path(
    post,
    path = "/api/realtime/start",
    request_body = StartPayload,
    responses(
        (status = 200, description = "Session is active", body = StartResponse),
        (status = 400, description = "Invalid configuration, unsupported provider or missing credential", body = ErrorResponse),
        (status = 401, description = "Provider rejected the credential", body = ErrorResponse),
        (status = 503, description = "Provider unreachable", body = ErrorResponse),
        (status = 504, description = "Provider did not acknowledge in time", body = ErrorResponse)
    )
)]
pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<StartPayload>,
) -> Result<Json<StartResponse>, ApiError> {
    let session_id = session_id_or_default(payload.session_id);
    let request = StartRequest {
        provider: parse_provider(payload.provider.as_deref())?,
        credential: secret(payload.api_key),
        model: payload.model.filter(|m| !m.trim().is_empty()),
        voice: payload.voice.filter(|v| !v.trim().is_empty()),
        instructions: payload.instructions,
    };
    let outcome = state.manager.start(&session_id, request).await?;
    Ok(Json(outcome.into()))
}

/// Stream one base64 PCM16 chunk into the current audio turn.
#[utoipa::path(
    post,
    path = "/api/realtime/audio",
    request_body = AudioPayload,
    responses(
        (status = 200, description = "Chunk forwarded", body = OkResponse),
        (status = 400, description = "Audio is not valid base64", body = ErrorResponse),
        (status = 409, description = "Session not ready", body = ErrorResponse)
    )
)]
pub async fn append_audio(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AudioPayload>,
) -> Result<Json<OkResponse>, ApiError> {
    let session_id = session_id_or_default(payload.session_id);
    state
        .manager
        .append_audio(&session_id, &payload.audio)
        .await?;
    Ok(Json(OkResponse { ok: true }))
}

/// End the current audio turn and ask the provider to respond.
#[utoipa::path(
    post,
    path = "/api/realtime/commit",
    request_body = SessionPayload,
    responses(
        (status = 200, description = "Turn committed", body = CommitResponse),
        (status = 409, description = "Session not ready", body = ErrorResponse)
    )
)]
pub async fn commit_audio(
    State(state): State<Arc<AppState>>,
    payload: Option<Json<SessionPayload>>,
) -> Result<Json<CommitResponse>, ApiError> {
    let session_id = session_id_or_default(payload.and_then(|Json(p)| p.session_id));
    let turn = state.manager.commit_audio(&session_id).await?;
    info!(%session_id, chunks = turn.chunks, bytes = turn.bytes, "Audio turn committed");
    Ok(Json(CommitResponse {
        ok: true,
        chunks: turn.chunks,
        bytes: turn.bytes,
    }))
}

/// Send a user text turn.
#[utoipa::path(
    post,
    path = "/api/realtime/text",
    request_body = TextPayload,
    responses(
        (status = 200, description = "Text sent", body = OkResponse),
        (status = 400, description = "Empty text", body = ErrorResponse),
        (status = 409, description = "Session not ready", body = ErrorResponse)
    )
)]
pub async fn send_text(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TextPayload>,
) -> Result<Json<OkResponse>, ApiError> {
    let session_id = session_id_or_default(payload.session_id);
    state.manager.send_text(&session_id, &payload.text).await?;
    Ok(Json(OkResponse { ok: true }))
}

/// Server-sent events for one session. Each SSE event is named after its kind
/// and carries the JSON event as data.
#[utoipa::path(
    get,
    path = "/api/realtime/events",
    params(EventsQuery),
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream", body = String),
        (status = 400, description = "Unknown event kind", body = ErrorResponse)
    )
)]
pub async fn stream_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, axum::Error>>>, ApiError> {
    let session_id = session_id_or_default(query.session_id);
    let kinds = parse_kinds(query.kinds.as_deref())?;
    info!(%session_id, "SSE subscriber connected");
    let events = state
        .manager
        .subscribe(&session_id, &kinds)
        .map(|event| {
            SseEvent::default()
                .event(event.kind().as_str())
                .json_data(&event)
        });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Stop and discard a session. Succeeds whether or not it existed.
#[utoipa::path(
    post,
    path = "/api/realtime/stop",
    request_body = SessionPayload,
    responses((status = 200, description = "Session stopped", body = OkResponse))
)]
pub async fn stop_session(
    State(state): State<Arc<AppState>>,
    payload: Option<Json<SessionPayload>>,
) -> Json<OkResponse> {
    let session_id = session_id_or_default(payload.and_then(|Json(p)| p.session_id));
    let existed = state.manager.stop(&session_id).await;
    info!(%session_id, existed, "Stop requested");
    Json(OkResponse { ok: true })
}

/// Report a session's status without creating it.
#[utoipa::path(
    get,
    path = "/api/realtime/status",
    params(SessionQuery),
    responses((status = 200, description = "Session status", body = StatusResponse))
)]
pub async fn session_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Json<StatusResponse> {
    let session_id = session_id_or_default(query.session_id);
    Json(state.manager.status(&session_id).into())
}

/// Relay a WebRTC SDP offer and return the provider's answer.
#[utoipa::path(
    post,
    path = "/api/realtime/sdp",
    request_body = SdpPayload,
    responses(
        (status = 200, description = "SDP answer", content_type = "application/sdp", body = String),
        (status = 400, description = "Malformed offer, unsupported provider or missing credential", body = ErrorResponse),
        (status = 502, description = "Provider rejected the offer", body = ErrorResponse),
        (status = 503, description = "Provider unreachable", body = ErrorResponse)
    )
)]
pub async fn negotiate_sdp(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SdpPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let provider = parse_provider(payload.provider.as_deref())?;
    let answer = state
        .manager
        .negotiate_sdp(
            &payload.sdp,
            provider,
            payload.model.as_deref().filter(|m| !m.trim().is_empty()),
            secret(payload.api_key),
        )
        .await?;
    Ok(([(header::CONTENT_TYPE, "application/sdp")], answer))
}
