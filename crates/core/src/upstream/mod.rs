//! The seam between a session and the provider it talks to.
//!
//! A [`UpstreamConnector`] opens one [`UpstreamLink`] per session start. The link
//! carries commands to the provider; provider traffic comes back, already
//! normalized, on the [`LinkEvent`] channel returned alongside it.

pub mod messages;
pub mod openai;

use crate::{
    config::{Provider, TurnDetection},
    error::{RealtimeError, RealtimeResult},
    event::Event,
};
use async_trait::async_trait;
use bytes::Bytes;
use secrecy::SecretString;
use tokio::sync::mpsc;

pub use openai::OpenAiConnector;

/// Resolved settings a link is opened with. The credential is always present.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub session_id: String,
    pub provider: Provider,
    pub model: String,
    pub credential: SecretString,
    pub voice: String,
    pub transcription_model: String,
    pub turn_detection: TurnDetection,
    pub instructions: Option<String>,
    pub temperature: Option<f32>,
}

/// What a link reports back to its session.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The provider acknowledged the session configuration.
    Ready,
    /// A normalized event for subscribers.
    Event(Event),
    /// The link failed. Before `Ready` this fails the start; after it, the session.
    Failed(RealtimeError),
}

/// A freshly opened link and the stream of what it hears.
pub struct UpstreamChannel {
    pub link: Box<dyn UpstreamLink>,
    pub events: mpsc::Receiver<LinkEvent>,
}

/// Commands a session can issue on an open link.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamLink: Send + Sync {
    /// Streams one chunk of raw PCM16 audio into the provider's input buffer.
    async fn send_audio(&self, chunk: Bytes) -> RealtimeResult<()>;

    /// Adds a user text turn to the conversation.
    async fn send_text(&self, text: String) -> RealtimeResult<()>;

    /// Marks the end of the current user audio turn.
    async fn commit(&self) -> RealtimeResult<()>;

    /// Asks the provider to produce an assistant response.
    async fn request_response(&self) -> RealtimeResult<()>;

    /// Closes the connection. Implementations must finish in bounded time.
    async fn close(&self);

    fn is_ready(&self) -> bool;

    fn last_error(&self) -> Option<RealtimeError>;
}

/// Opens links to one provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Connects and sends the initial session configuration. Returns once the
    /// connection is open; acknowledgment arrives later as [`LinkEvent::Ready`].
    async fn open(&self, options: LinkOptions) -> RealtimeResult<UpstreamChannel>;
}
