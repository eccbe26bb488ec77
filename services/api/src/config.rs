use secrecy::SecretString;
use std::{net::SocketAddr, str::FromStr, time::Duration};
use studio_realtime::{
    ManagerConfig, OpenAiEndpoints, SessionOptions,
    config::{
        DEFAULT_OPENAI_REALTIME_URL, DEFAULT_OPENAI_SDP_URL, DEFAULT_REALTIME_MODEL,
        DEFAULT_TRANSCRIPTION_MODEL, DEFAULT_VOICE,
    },
};
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub openai_api_key: Option<SecretString>,
    pub realtime_model: String,
    pub voice: String,
    pub transcription_model: String,
    pub instructions: Option<String>,
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub ready_timeout: Duration,
    pub openai_realtime_url: String,
    pub openai_sdp_url: String,
    /// `*` allows any origin.
    pub allowed_origin: String,
    pub log_level: Level,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        _ => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address = parse_var("BIND_ADDRESS", SocketAddr::from(([0, 0, 0, 0], 8000)))?;

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from);

        let idle_secs: u64 = parse_var("SESSION_IDLE_TIMEOUT_SECS", 600)?;
        let handshake_secs: u64 = parse_var("HANDSHAKE_TIMEOUT_SECS", 10)?;
        let ready_ms: u64 = parse_var("READY_WAIT_TIMEOUT_MS", 5000)?;
        for (name, value) in [
            ("SESSION_IDLE_TIMEOUT_SECS", idle_secs),
            ("HANDSHAKE_TIMEOUT_SECS", handshake_secs),
            ("READY_WAIT_TIMEOUT_MS", ready_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(
                    name.to_string(),
                    "must be greater than zero".to_string(),
                ));
            }
        }

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            openai_api_key,
            realtime_model: var_or("REALTIME_MODEL", DEFAULT_REALTIME_MODEL),
            voice: var_or("REALTIME_VOICE", DEFAULT_VOICE),
            transcription_model: var_or("TRANSCRIPTION_MODEL", DEFAULT_TRANSCRIPTION_MODEL),
            instructions: std::env::var("REALTIME_INSTRUCTIONS")
                .ok()
                .filter(|i| !i.trim().is_empty()),
            idle_timeout: Duration::from_secs(idle_secs),
            handshake_timeout: Duration::from_secs(handshake_secs),
            ready_timeout: Duration::from_millis(ready_ms),
            openai_realtime_url: var_or("OPENAI_REALTIME_URL", DEFAULT_OPENAI_REALTIME_URL),
            openai_sdp_url: var_or("OPENAI_SDP_URL", DEFAULT_OPENAI_SDP_URL),
            allowed_origin: var_or("ALLOWED_ORIGIN", "http://localhost:3000"),
            log_level,
        })
    }

    /// The session manager's view of this configuration.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            idle_timeout: self.idle_timeout,
            handshake_timeout: self.handshake_timeout,
            ready_timeout: self.ready_timeout,
            openai: OpenAiEndpoints {
                realtime_url: self.openai_realtime_url.clone(),
                sdp_url: self.openai_sdp_url.clone(),
            },
            fallback_credential: self.openai_api_key.clone(),
            defaults: SessionOptions {
                model: self.realtime_model.clone(),
                voice: self.voice.clone(),
                transcription_model: self.transcription_model.clone(),
                instructions: self.instructions.clone(),
                ..SessionOptions::default()
            },
            ..ManagerConfig::default()
        }
    }
}
