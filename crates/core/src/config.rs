//! Provider selection, per-session options and manager-wide settings.

use crate::error::{RealtimeError, RealtimeResult};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};

pub const DEFAULT_OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_OPENAI_SDP_URL: &str = "https://api.openai.com/v1/realtime";
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";
pub const DEFAULT_VOICE: &str = "alloy";
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Conversational AI providers known to the manager.
///
/// Only [`Provider::OpenAi`] is fully supported. The others are recognised so
/// callers get `UnsupportedProvider` instead of a parse error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    Gemini,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Gemini => "gemini",
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, Provider::OpenAi)
    }

    /// Fails with `UnsupportedProvider` for reserved providers.
    pub fn ensure_supported(&self) -> RealtimeResult<()> {
        if self.is_supported() {
            Ok(())
        } else {
            Err(RealtimeError::UnsupportedProvider(self.as_str().to_string()))
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "gemini" => Ok(Provider::Gemini),
            other => Err(RealtimeError::UnsupportedProvider(other.to_string())),
        }
    }
}

/// Voice-activity-detection mode requested from the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnDetection {
    /// Provider-side VAD decides when a user turn ends.
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
    /// Turns end only on an explicit commit.
    Disabled,
}

impl Default for TurnDetection {
    fn default() -> Self {
        TurnDetection::ServerVad {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

/// Everything `configure` can set on a session before it starts.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub provider: Provider,
    pub model: String,
    pub credential: Option<SecretString>,
    pub voice: String,
    pub transcription_model: String,
    pub turn_detection: TurnDetection,
    pub instructions: Option<String>,
    pub temperature: Option<f32>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            provider: Provider::OpenAi,
            model: DEFAULT_REALTIME_MODEL.to_string(),
            credential: None,
            voice: DEFAULT_VOICE.to_string(),
            transcription_model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            turn_detection: TurnDetection::default(),
            instructions: None,
            temperature: None,
        }
    }
}

impl SessionOptions {
    /// Rejects option sets that can never produce a working upstream link.
    pub fn validate(&self) -> RealtimeResult<()> {
        self.provider.ensure_supported()?;
        if self.model.trim().is_empty() {
            return Err(RealtimeError::InvalidConfiguration(
                "model must not be empty".to_string(),
            ));
        }
        if self.voice.trim().is_empty() {
            return Err(RealtimeError::InvalidConfiguration(
                "voice must not be empty".to_string(),
            ));
        }
        if let Some(t) = self.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(RealtimeError::InvalidConfiguration(format!(
                "temperature {t} is outside 0.0..=2.0"
            )));
        }
        Ok(())
    }
}

/// Endpoints of the primary provider. Overridable for tests and proxies.
#[derive(Debug, Clone)]
pub struct OpenAiEndpoints {
    pub realtime_url: String,
    pub sdp_url: String,
}

impl Default for OpenAiEndpoints {
    fn default() -> Self {
        Self {
            realtime_url: DEFAULT_OPENAI_REALTIME_URL.to_string(),
            sdp_url: DEFAULT_OPENAI_SDP_URL.to_string(),
        }
    }
}

/// Process-wide settings for the session manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Sessions without activity for this long are stopped and evicted.
    pub idle_timeout: Duration,
    /// Upper bound on connect plus provider acknowledgment.
    pub handshake_timeout: Duration,
    /// How long append/commit/text wait for a `starting` session.
    pub ready_timeout: Duration,
    /// Upper bound on closing an upstream link.
    pub close_timeout: Duration,
    /// Per-subscriber queue depth; events beyond it are dropped for that subscriber.
    pub subscriber_capacity: usize,
    pub openai: OpenAiEndpoints,
    /// Credential used when a start request does not carry one.
    pub fallback_credential: Option<SecretString>,
    /// Options a freshly created session starts with.
    pub defaults: SessionOptions,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            handshake_timeout: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(2),
            subscriber_capacity: 256,
            openai: OpenAiEndpoints::default(),
            fallback_credential: None,
            defaults: SessionOptions::default(),
        }
    }
}
