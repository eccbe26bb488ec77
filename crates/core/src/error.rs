//! Error taxonomy for the realtime session manager.
//!
//! Every failure carries a stable [`ErrorKind`] so HTTP adapters can map it to a
//! status code without inspecting messages. Messages never contain credentials
//! or raw provider payloads.

use crate::session::SessionStatus;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Errors produced by sessions, the registry, upstream links and the SDP relay.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RealtimeError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Missing credential for provider {0}")]
    MissingCredential(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Timed out waiting for the provider handshake after {0} ms")]
    HandshakeTimeout(u64),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The session is not `active`. Carries the status observed at failure time.
    #[error("Session not ready (status: {status})")]
    SessionNotReady { status: SessionStatus },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// The provider's negotiation endpoint answered with a non-success status.
    #[error("Upstream negotiation failed with status {status}: {message}")]
    BadGateway { status: u16, message: String },

    #[error("Internal failure: {0}")]
    InternalFailure(String),
}

/// Result type for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Machine-checkable error code, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidConfiguration,
    MissingCredential,
    AuthenticationFailed,
    HandshakeTimeout,
    UpstreamUnavailable,
    SessionNotReady,
    InvalidInput,
    UnsupportedProvider,
    BadGateway,
    InternalFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidConfiguration => "invalid_configuration",
            ErrorKind::MissingCredential => "missing_credential",
            ErrorKind::AuthenticationFailed => "authentication_failed",
            ErrorKind::HandshakeTimeout => "handshake_timeout",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::SessionNotReady => "session_not_ready",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::UnsupportedProvider => "unsupported_provider",
            ErrorKind::BadGateway => "bad_gateway",
            ErrorKind::InternalFailure => "internal_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RealtimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RealtimeError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            RealtimeError::MissingCredential(_) => ErrorKind::MissingCredential,
            RealtimeError::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            RealtimeError::HandshakeTimeout(_) => ErrorKind::HandshakeTimeout,
            RealtimeError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            RealtimeError::SessionNotReady { .. } => ErrorKind::SessionNotReady,
            RealtimeError::InvalidInput(_) => ErrorKind::InvalidInput,
            RealtimeError::UnsupportedProvider(_) => ErrorKind::UnsupportedProvider,
            RealtimeError::BadGateway { .. } => ErrorKind::BadGateway,
            RealtimeError::InternalFailure(_) => ErrorKind::InternalFailure,
        }
    }

    pub(crate) fn not_ready(status: SessionStatus) -> Self {
        RealtimeError::SessionNotReady { status }
    }

    /// The session status attached to a readiness failure, if any.
    pub fn session_status(&self) -> Option<SessionStatus> {
        match self {
            RealtimeError::SessionNotReady { status } => Some(*status),
            _ => None,
        }
    }

    /// Whether waiting and retrying the same call can succeed without a restart.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RealtimeError::SessionNotReady {
                status: SessionStatus::Starting
            }
        )
    }
}

/// Bounds text that came from a provider before it goes into an error message.
/// Control characters are removed and anything past `max_chars` is cut.
pub(crate) fn sanitize_detail(text: &str, max_chars: usize) -> String {
    let mut cut: String = text
        .chars()
        .filter(|c| !c.is_control())
        .take(max_chars)
        .collect();
    if text.chars().filter(|c| !c.is_control()).count() > max_chars {
        cut.push('…');
    }
    cut
}
