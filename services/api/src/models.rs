//! Request and response bodies of the HTTP surface.
//!
//! These mirror the manager's calls one to one and carry `utoipa` schemas for
//! the OpenAPI document. Credentials only ever travel inward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use studio_realtime::{StartOutcome, StatusSnapshot};
use utoipa::{IntoParams, ToSchema};

/// Session identifier used when a request does not name one.
pub const DEFAULT_SESSION_ID: &str = "default";

pub fn session_id_or_default(session_id: Option<String>) -> String {
    session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string())
}

#[derive(Deserialize, ToSchema, Default)]
pub struct StartPayload {
    #[schema(example = "default")]
    pub session_id: Option<String>,
    #[schema(example = "openai")]
    pub provider: Option<String>,
    /// Overrides the server-side key for this session. Never echoed back.
    pub api_key: Option<String>,
    #[schema(example = "gpt-4o-realtime-preview-2024-10-01")]
    pub model: Option<String>,
    #[schema(example = "alloy")]
    pub voice: Option<String>,
    pub instructions: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct StartResponse {
    pub session_id: String,
    #[schema(example = "active")]
    pub status: String,
    #[schema(example = "openai")]
    pub provider: String,
    pub model: String,
}

impl From<StartOutcome> for StartResponse {
    fn from(outcome: StartOutcome) -> Self {
        Self {
            session_id: outcome.session_id,
            status: outcome.status.to_string(),
            provider: outcome.provider.to_string(),
            model: outcome.model,
        }
    }
}

#[derive(Deserialize, ToSchema)]
pub struct AudioPayload {
    pub session_id: Option<String>,
    /// Base64-encoded PCM16 audio.
    #[schema(example = "AAABAAIA")]
    pub audio: String,
}

#[derive(Deserialize, ToSchema, Default)]
pub struct SessionPayload {
    pub session_id: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct TextPayload {
    pub session_id: Option<String>,
    #[schema(example = "Let's talk about attention mechanisms.")]
    pub text: String,
}

#[derive(Deserialize, ToSchema)]
pub struct SdpPayload {
    /// The browser's SDP offer.
    pub sdp: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct CommitResponse {
    pub ok: bool,
    /// Chunks in the committed turn.
    pub chunks: usize,
    /// Decoded bytes in the committed turn.
    pub bytes: usize,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct StatusResponse {
    pub session_id: String,
    #[schema(example = "idle")]
    pub status: String,
    pub is_active: bool,
    pub is_starting: bool,
    pub provider: String,
    pub model: String,
    pub has_credential: bool,
    pub total_active_sessions: usize,
}

impl From<StatusSnapshot> for StatusResponse {
    fn from(snapshot: StatusSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id,
            status: snapshot.status.to_string(),
            is_active: snapshot.is_active,
            is_starting: snapshot.is_starting,
            provider: snapshot.provider.to_string(),
            model: snapshot.model,
            has_credential: snapshot.has_credential,
            total_active_sessions: snapshot.total_active_sessions,
        }
    }
}

#[derive(Deserialize, IntoParams)]
pub struct SessionQuery {
    pub session_id: Option<String>,
}

#[derive(Deserialize, IntoParams)]
pub struct EventsQuery {
    pub session_id: Option<String>,
    /// Comma-separated event kinds, e.g. `assistant_text_delta,error`. All kinds when absent.
    pub kinds: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    /// Stable machine-readable code, e.g. `session_not_ready`.
    #[schema(example = "session_not_ready")]
    pub error: String,
    pub message: String,
    /// Session status, for readiness errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct RootResponse {
    pub message: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct HealthResponse {
    #[schema(example = "healthy")]
    pub status: String,
    pub timestamp: DateTime<Utc>,
    /// Model used when a start request does not name one.
    #[schema(example = "gpt-4o-realtime-preview-2024-10-01")]
    pub default_model: String,
    /// Whether the server holds its own provider credential.
    pub credential_configured: bool,
}
