//! The facade request handlers talk to.
//!
//! Resolves credentials and defaults, routes each call through the registry so
//! it counts as activity, and waits a bounded time for sessions that are still
//! starting before driving them.

use crate::{
    audio::{CommittedTurn, decode_chunk},
    config::{ManagerConfig, Provider, SessionOptions},
    error::{RealtimeError, RealtimeResult},
    event::EventKind,
    registry::SessionRegistry,
    sdp::SdpRelay,
    session::{Session, SessionStatus, Subscription},
    upstream::{OpenAiConnector, UpstreamConnector},
};
use futures_util::stream::{SelectAll, select_all};
use secrecy::SecretString;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Timeout for the one-shot SDP exchange.
const SDP_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Events of several kinds from one session, merged in arrival order.
pub type EventStream = SelectAll<Subscription>;

/// Caller overrides for `start`. Unset fields fall back to the service defaults.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub provider: Option<Provider>,
    pub credential: Option<SecretString>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartOutcome {
    pub session_id: String,
    pub status: SessionStatus,
    pub provider: Provider,
    pub model: String,
}

/// Point-in-time view of one session. Never carries the credential itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    pub is_active: bool,
    pub is_starting: bool,
    pub provider: Provider,
    pub model: String,
    pub has_credential: bool,
    pub total_active_sessions: usize,
}

pub struct RealtimeManager {
    config: Arc<ManagerConfig>,
    registry: Arc<SessionRegistry>,
    relay: SdpRelay,
}

impl RealtimeManager {
    /// Builds a manager that talks to OpenAI over the configured endpoints.
    pub fn new(config: ManagerConfig) -> RealtimeResult<Self> {
        let connector = OpenAiConnector::new(config.openai.realtime_url.clone(), config.close_timeout);
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(
        config: ManagerConfig,
        connector: Arc<dyn UpstreamConnector>,
    ) -> RealtimeResult<Self> {
        let relay = SdpRelay::new(
            config.openai.sdp_url.clone(),
            std::time::Duration::from_secs(SDP_REQUEST_TIMEOUT_SECS),
        )?;
        let config = Arc::new(config);
        Ok(Self {
            registry: SessionRegistry::new(config.clone(), connector),
            config,
            relay,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn resolve_credential(&self, explicit: Option<SecretString>) -> Option<SecretString> {
        explicit
            .or_else(|| self.config.fallback_credential.clone())
            .or_else(|| self.config.defaults.credential.clone())
    }

    /// Configures and starts the session, or joins a start already in flight.
    pub async fn start(&self, session_id: &str, request: StartRequest) -> RealtimeResult<StartOutcome> {
        let session = self.registry.get_or_create(session_id);

        if matches!(session.status(), SessionStatus::Idle | SessionStatus::Error) {
            let defaults = &self.config.defaults;
            let provider = request.provider.unwrap_or(defaults.provider);
            let credential = self
                .resolve_credential(request.credential)
                .ok_or_else(|| RealtimeError::MissingCredential(provider.to_string()))?;
            let options = SessionOptions {
                provider,
                model: request.model.unwrap_or_else(|| defaults.model.clone()),
                credential: Some(credential),
                voice: request.voice.unwrap_or_else(|| defaults.voice.clone()),
                instructions: request.instructions.or_else(|| defaults.instructions.clone()),
                ..defaults.clone()
            };
            options.validate()?;
            if let Err(err) = session.configure(options) {
                // Another caller may have claimed the start in between; join it.
                if !matches!(session.status(), SessionStatus::Starting | SessionStatus::Active) {
                    return Err(err);
                }
                debug!(session_id, "Session claimed concurrently; joining its start");
            }
        }

        session.start().await?;
        let configuration = session.configuration();
        info!(session_id, provider = %configuration.provider, "Realtime session started");
        Ok(StartOutcome {
            session_id: session_id.to_string(),
            status: session.status(),
            provider: configuration.provider,
            model: configuration.model,
        })
    }

    /// Looks the session up and, if it is still starting, waits for it.
    async fn ready_session(&self, session_id: &str) -> RealtimeResult<Arc<Session>> {
        let session = self.registry.get_or_create(session_id);
        if session.is_starting() {
            session.wait_until_ready(self.config.ready_timeout).await?;
        }
        Ok(session)
    }

    pub async fn append_audio(&self, session_id: &str, base64_chunk: &str) -> RealtimeResult<()> {
        let chunk = decode_chunk(base64_chunk)?;
        self.ready_session(session_id)
            .await?
            .append_audio(chunk)
            .await
    }

    pub async fn commit_audio(&self, session_id: &str) -> RealtimeResult<CommittedTurn> {
        self.ready_session(session_id).await?.commit_audio().await
    }

    pub async fn send_text(&self, session_id: &str, text: &str) -> RealtimeResult<()> {
        if text.trim().is_empty() {
            return Err(RealtimeError::InvalidInput(
                "text must not be empty".to_string(),
            ));
        }
        self.ready_session(session_id)
            .await?
            .send_text(text.to_string())
            .await
    }

    /// Subscribes to one or more event kinds; an empty slice means all kinds.
    ///
    /// The stream ends when the session stops. Dropping it deregisters every
    /// underlying listener.
    pub fn subscribe(&self, session_id: &str, kinds: &[EventKind]) -> EventStream {
        let session = self.registry.get_or_create(session_id);
        let kinds = if kinds.is_empty() {
            &EventKind::ALL[..]
        } else {
            kinds
        };
        debug!(session_id, kinds = kinds.len(), "Subscribing to session events");
        select_all(kinds.iter().map(|kind| session.on(*kind)))
    }

    /// Relays a WebRTC offer. Does not touch any session.
    pub async fn negotiate_sdp(
        &self,
        offer: &str,
        provider: Option<Provider>,
        model: Option<&str>,
        credential: Option<SecretString>,
    ) -> RealtimeResult<String> {
        let provider = provider.unwrap_or(self.config.defaults.provider);
        let model = model.unwrap_or(self.config.defaults.model.as_str());
        let credential = self.resolve_credential(credential);
        self.relay
            .negotiate(offer, provider, model, credential.as_ref())
            .await
    }

    /// Stops and evicts the session. Returns whether one was tracked.
    pub async fn stop(&self, session_id: &str) -> bool {
        self.registry.remove(session_id).await
    }

    /// Reports on a session without creating it or refreshing its idle timer.
    pub fn status(&self, session_id: &str) -> StatusSnapshot {
        let total_active_sessions = self.registry.active_count();
        match self.registry.get(session_id) {
            Some(session) => {
                let configuration = session.configuration();
                let status = session.status();
                StatusSnapshot {
                    session_id: session_id.to_string(),
                    status,
                    is_active: status == SessionStatus::Active,
                    is_starting: status == SessionStatus::Starting,
                    provider: configuration.provider,
                    model: configuration.model,
                    has_credential: configuration.has_credential,
                    total_active_sessions,
                }
            }
            None => {
                let defaults = &self.config.defaults;
                StatusSnapshot {
                    session_id: session_id.to_string(),
                    status: SessionStatus::Idle,
                    is_active: false,
                    is_starting: false,
                    provider: defaults.provider,
                    model: defaults.model.clone(),
                    has_credential: false,
                    total_active_sessions,
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
