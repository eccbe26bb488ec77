//! OpenAI Realtime socket link.
//!
//! One Tokio task owns the WebSocket. Commands reach it over an mpsc channel and
//! provider events leave it, translated, over another. The task ends on an
//! explicit close, on a socket failure, or when the link handle is dropped.

use super::{
    LinkEvent, LinkOptions, UpstreamChannel, UpstreamConnector, UpstreamLink,
    messages::{
        ClientEvent, ConversationItem, InputAudioTranscription, ServerEvent, SessionConfig,
        TurnDetection as WireTurnDetection, new_event_id,
    },
};
use crate::{
    audio::encode_chunk,
    config::{Provider, TurnDetection},
    error::{ErrorKind, RealtimeError, RealtimeResult, sanitize_detail},
    event::Event,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message, client::IntoClientRequest, http::HeaderValue},
};
use tracing::{debug, error, info, trace, warn};

/// Channel capacity for outgoing commands.
const COMMAND_CHANNEL_CAPACITY: usize = 256;
/// Channel capacity for translated events heading to the session.
const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Provider error messages are cut to this many characters before reaching clients.
const MAX_PROVIDER_MESSAGE_CHARS: usize = 200;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum LinkCommand {
    Send(ClientEvent),
    Close,
}

/// Opens socket-mode links to the OpenAI Realtime API.
#[derive(Debug, Clone)]
pub struct OpenAiConnector {
    realtime_url: String,
    close_timeout: Duration,
}

impl OpenAiConnector {
    pub fn new(realtime_url: impl Into<String>, close_timeout: Duration) -> Self {
        Self {
            realtime_url: realtime_url.into(),
            close_timeout,
        }
    }

    fn build_ws_url(&self, model: &str) -> RealtimeResult<String> {
        let mut url = reqwest::Url::parse(&self.realtime_url)
            .map_err(|e| RealtimeError::InvalidConfiguration(format!("realtime url: {e}")))?;
        url.query_pairs_mut().append_pair("model", model);
        Ok(url.into())
    }

    fn build_session_config(options: &LinkOptions) -> SessionConfig {
        SessionConfig {
            modalities: vec!["text".to_string(), "audio".to_string()],
            voice: options.voice.clone(),
            instructions: options.instructions.clone(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: InputAudioTranscription {
                model: options.transcription_model.clone(),
            },
            turn_detection: match options.turn_detection {
                TurnDetection::ServerVad {
                    threshold,
                    prefix_padding_ms,
                    silence_duration_ms,
                } => Some(WireTurnDetection::ServerVad {
                    threshold,
                    prefix_padding_ms,
                    silence_duration_ms,
                }),
                TurnDetection::Disabled => None,
            },
            temperature: options.temperature,
        }
    }
}

#[async_trait]
impl UpstreamConnector for OpenAiConnector {
    async fn open(&self, options: LinkOptions) -> RealtimeResult<UpstreamChannel> {
        if options.provider != Provider::OpenAi {
            return Err(RealtimeError::UnsupportedProvider(
                options.provider.to_string(),
            ));
        }

        let mut request = self
            .build_ws_url(&options.model)?
            .into_client_request()
            .map_err(|e| RealtimeError::InvalidConfiguration(format!("realtime url: {e}")))?;
        let mut auth = format!("Bearer {}", options.credential.expose_secret())
            .parse::<HeaderValue>()
            .map_err(|_| {
                RealtimeError::InvalidConfiguration(
                    "credential contains characters not allowed in a header".to_string(),
                )
            })?;
        auth.set_sensitive(true);
        request.headers_mut().insert("Authorization", auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (mut socket, _response) = connect_async(request).await.map_err(map_connect_error)?;
        info!(session_id = %options.session_id, model = %options.model, "Connected to OpenAI Realtime API");

        let update = ClientEvent::SessionUpdate {
            event_id: new_event_id(),
            session: Self::build_session_config(&options),
        };
        let json = serde_json::to_string(&update)
            .map_err(|e| RealtimeError::InternalFailure(e.to_string()))?;
        socket
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| RealtimeError::UpstreamUnavailable(e.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let state = Arc::new(LinkState::default());
        let task = tokio::spawn(run_socket(
            socket,
            command_rx,
            event_tx,
            state.clone(),
            options.session_id.clone(),
        ));

        Ok(UpstreamChannel {
            link: Box::new(OpenAiLink {
                commands: command_tx,
                state,
                task: parking_lot::Mutex::new(Some(task)),
                close_timeout: self.close_timeout,
            }),
            events: event_rx,
        })
    }
}

fn map_connect_error(err: tungstenite::Error) -> RealtimeError {
    match err {
        tungstenite::Error::Http(response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            RealtimeError::AuthenticationFailed(format!(
                "provider rejected the credential (HTTP {})",
                response.status().as_u16()
            ))
        }
        tungstenite::Error::Http(response) => RealtimeError::UpstreamUnavailable(format!(
            "provider refused the connection (HTTP {})",
            response.status().as_u16()
        )),
        other => RealtimeError::UpstreamUnavailable(other.to_string()),
    }
}

#[derive(Default)]
struct LinkState {
    ready: AtomicBool,
    last_error: parking_lot::Mutex<Option<RealtimeError>>,
}

impl LinkState {
    fn record_failure(&self, err: &RealtimeError) {
        self.ready.store(false, Ordering::SeqCst);
        *self.last_error.lock() = Some(err.clone());
    }
}

/// Handle to one open OpenAI socket.
pub struct OpenAiLink {
    commands: mpsc::Sender<LinkCommand>,
    state: Arc<LinkState>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    close_timeout: Duration,
}

impl OpenAiLink {
    async fn send(&self, event: ClientEvent) -> RealtimeResult<()> {
        trace!(event_type = event.event_type(), "Queueing client event");
        self.commands
            .send(LinkCommand::Send(event))
            .await
            .map_err(|_| {
                self.last_error().unwrap_or_else(|| {
                    RealtimeError::UpstreamUnavailable("upstream link is closed".to_string())
                })
            })
    }
}

#[async_trait]
impl UpstreamLink for OpenAiLink {
    async fn send_audio(&self, chunk: Bytes) -> RealtimeResult<()> {
        self.send(ClientEvent::InputAudioBufferAppend {
            event_id: new_event_id(),
            audio: encode_chunk(&chunk),
        })
        .await
    }

    async fn send_text(&self, text: String) -> RealtimeResult<()> {
        self.send(ClientEvent::ConversationItemCreate {
            event_id: new_event_id(),
            item: ConversationItem::user_text(text),
        })
        .await
    }

    async fn commit(&self) -> RealtimeResult<()> {
        self.send(ClientEvent::InputAudioBufferCommit {
            event_id: new_event_id(),
        })
        .await
    }

    async fn request_response(&self) -> RealtimeResult<()> {
        self.send(ClientEvent::ResponseCreate {
            event_id: new_event_id(),
        })
        .await
    }

    async fn close(&self) {
        let Some(mut task) = self.task.lock().take() else {
            return;
        };
        let _ = self.commands.try_send(LinkCommand::Close);
        if tokio::time::timeout(self.close_timeout, &mut task)
            .await
            .is_err()
        {
            warn!("Upstream link did not close in time; aborting socket task");
            task.abort();
        }
        self.state.ready.store(false, Ordering::SeqCst);
    }

    fn is_ready(&self) -> bool {
        self.state.ready.load(Ordering::SeqCst)
    }

    fn last_error(&self) -> Option<RealtimeError> {
        self.state.last_error.lock().clone()
    }
}

impl Drop for OpenAiLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Owns the socket until close or failure.
async fn run_socket(
    socket: Socket,
    mut commands: mpsc::Receiver<LinkCommand>,
    events: mpsc::Sender<LinkEvent>,
    state: Arc<LinkState>,
    session_id: String,
) {
    let (mut sink, mut stream) = socket.split();
    let mut translator = EventTranslator::default();

    let failure = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Send(event)) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            error!(%session_id, "Failed to serialize client event: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(json.into())).await {
                        break RealtimeError::UpstreamUnavailable(format!("send failed: {e}"));
                    }
                }
                Some(LinkCommand::Close) | None => {
                    debug!(%session_id, "Closing upstream socket");
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    state.ready.store(false, Ordering::SeqCst);
                    return;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let event = match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => event,
                        Err(e) => break RealtimeError::UpstreamUnavailable(format!(
                            "malformed provider event: {e}"
                        )),
                    };
                    for link_event in translator.translate(event) {
                        if matches!(link_event, LinkEvent::Ready) {
                            state.ready.store(true, Ordering::SeqCst);
                        }
                        if let LinkEvent::Failed(err) = &link_event {
                            state.record_failure(err);
                        }
                        if events.send(link_event).await.is_err() {
                            debug!(%session_id, "Session stopped listening; ending socket task");
                            return;
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sink.send(Message::Pong(data)).await {
                        break RealtimeError::UpstreamUnavailable(format!("pong failed: {e}"));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.as_str().to_owned())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "no reason given".to_string());
                    break RealtimeError::UpstreamUnavailable(format!(
                        "provider closed the connection: {reason}"
                    ));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break RealtimeError::UpstreamUnavailable(e.to_string()),
                None => break RealtimeError::UpstreamUnavailable(
                    "provider connection ended".to_string(),
                ),
            },
        }
    };

    warn!(%session_id, error = %failure, "Upstream link failed");
    state.record_failure(&failure);
    let _ = events.send(LinkEvent::Failed(failure)).await;
}

fn truncate_message(message: &str) -> String {
    sanitize_detail(message, MAX_PROVIDER_MESSAGE_CHARS)
}

/// Turns provider events into link events. Tracks handshake acknowledgment and
/// whether the assistant is mid-utterance.
#[derive(Debug, Default)]
pub(crate) struct EventTranslator {
    acknowledged: bool,
    speaking: bool,
}

impl EventTranslator {
    pub(crate) fn translate(&mut self, event: ServerEvent) -> Vec<LinkEvent> {
        match event {
            ServerEvent::SessionCreated { session } => {
                debug!(provider_session = %session.id, "Provider session created");
                Vec::new()
            }
            ServerEvent::SessionUpdated { session } => {
                if self.acknowledged {
                    debug!(provider_session = %session.id, "Provider session updated");
                    Vec::new()
                } else {
                    self.acknowledged = true;
                    vec![LinkEvent::Ready]
                }
            }
            ServerEvent::Error { error } => {
                let message = truncate_message(&error.message);
                if !self.acknowledged {
                    let err = if error.is_auth_failure() {
                        RealtimeError::AuthenticationFailed(message)
                    } else {
                        RealtimeError::UpstreamUnavailable(message)
                    };
                    vec![LinkEvent::Failed(err)]
                } else {
                    warn!(error_type = %error.error_type, code = ?error.code, "Provider reported an error");
                    vec![LinkEvent::Event(Event::Error {
                        code: ErrorKind::BadGateway,
                        message,
                    })]
                }
            }
            ServerEvent::AudioDelta { delta } => {
                let mut out = Vec::with_capacity(2);
                if !self.speaking {
                    self.speaking = true;
                    out.push(LinkEvent::Event(Event::AssistantSpeechStarted));
                }
                out.push(LinkEvent::Event(Event::AssistantAudioDelta { audio: delta }));
                out
            }
            ServerEvent::AudioDone {} | ServerEvent::ResponseDone {} => {
                if self.speaking {
                    self.speaking = false;
                    vec![LinkEvent::Event(Event::AssistantSpeechStopped)]
                } else {
                    Vec::new()
                }
            }
            ServerEvent::TextDelta { delta } | ServerEvent::AudioTranscriptDelta { delta } => {
                vec![LinkEvent::Event(Event::AssistantTextDelta { text: delta })]
            }
            ServerEvent::InputTranscriptionDelta { delta } => {
                vec![LinkEvent::Event(Event::UserTranscriptDelta {
                    text: delta,
                    is_final: false,
                })]
            }
            ServerEvent::InputTranscriptionCompleted { transcript } => {
                vec![LinkEvent::Event(Event::UserTranscriptDelta {
                    text: transcript,
                    is_final: true,
                })]
            }
            ServerEvent::ResponseCreated {} => Vec::new(),
            ServerEvent::Unknown => {
                trace!("Dropping unrecognized provider event");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionOptions;
    use secrecy::SecretString;

    fn parse(json: &str) -> ServerEvent {
        serde_json::from_str(json).unwrap()
    }

    fn link_options() -> LinkOptions {
        let defaults = SessionOptions::default();
        LinkOptions {
            session_id: "s1".into(),
            provider: Provider::OpenAi,
            model: defaults.model,
            credential: SecretString::from("sk-test".to_string()),
            voice: "verse".into(),
            transcription_model: defaults.transcription_model,
            turn_detection: TurnDetection::Disabled,
            instructions: Some("You are Dr. Sarah.".into()),
            temperature: Some(0.8),
        }
    }

    #[test]
    fn test_ack_is_first_session_updated() {
        let mut translator = EventTranslator::default();
        assert!(translator
            .translate(parse(r#"{"type":"session.created","session":{"id":"sess_1"}}"#))
            .is_empty());
        assert_eq!(
            translator.translate(parse(r#"{"type":"session.updated","session":{"id":"sess_1"}}"#)),
            vec![LinkEvent::Ready]
        );
        assert!(translator
            .translate(parse(r#"{"type":"session.updated","session":{"id":"sess_1"}}"#))
            .is_empty());
    }

    #[test]
    fn test_error_before_ack_fails_handshake() {
        let mut translator = EventTranslator::default();
        let out = translator.translate(parse(
            r#"{"type":"error","error":{"type":"invalid_request_error","code":"invalid_api_key","message":"bad key"}}"#,
        ));
        assert_eq!(
            out,
            vec![LinkEvent::Failed(RealtimeError::AuthenticationFailed(
                "bad key".into()
            ))]
        );
    }

    #[test]
    fn test_error_after_ack_is_an_event() {
        let mut translator = EventTranslator::default();
        translator.translate(parse(r#"{"type":"session.updated","session":{"id":"s"}}"#));
        let out = translator.translate(parse(
            r#"{"type":"error","error":{"type":"invalid_request_error","message":"buffer too small"}}"#,
        ));
        assert_eq!(
            out,
            vec![LinkEvent::Event(Event::Error {
                code: ErrorKind::BadGateway,
                message: "buffer too small".into()
            })]
        );
    }

    #[test]
    fn test_speech_boundaries_wrap_audio_deltas() {
        let mut translator = EventTranslator::default();
        let first = translator.translate(parse(r#"{"type":"response.audio.delta","delta":"AA=="}"#));
        assert_eq!(
            first,
            vec![
                LinkEvent::Event(Event::AssistantSpeechStarted),
                LinkEvent::Event(Event::AssistantAudioDelta { audio: "AA==".into() }),
            ]
        );
        let second = translator.translate(parse(r#"{"type":"response.audio.delta","delta":"AQ=="}"#));
        assert_eq!(
            second,
            vec![LinkEvent::Event(Event::AssistantAudioDelta { audio: "AQ==".into() })]
        );
        assert_eq!(
            translator.translate(parse(r#"{"type":"response.audio.done"}"#)),
            vec![LinkEvent::Event(Event::AssistantSpeechStopped)]
        );
        assert!(translator
            .translate(parse(r#"{"type":"response.done","response":{}}"#))
            .is_empty());
    }

    #[test]
    fn test_text_and_transcripts() {
        let mut translator = EventTranslator::default();
        assert_eq!(
            translator.translate(parse(r#"{"type":"response.audio_transcript.delta","delta":"Hel"}"#)),
            vec![LinkEvent::Event(Event::AssistantTextDelta { text: "Hel".into() })]
        );
        assert_eq!(
            translator.translate(parse(r#"{"type":"response.text.delta","delta":"lo"}"#)),
            vec![LinkEvent::Event(Event::AssistantTextDelta { text: "lo".into() })]
        );
        assert_eq!(
            translator.translate(parse(
                r#"{"type":"conversation.item.input_audio_transcription.completed","item_id":"i","content_index":0,"transcript":"hi there"}"#
            )),
            vec![LinkEvent::Event(Event::UserTranscriptDelta {
                text: "hi there".into(),
                is_final: true
            })]
        );
        assert!(translator
            .translate(parse(r#"{"type":"input_audio_buffer.speech_started","audio_start_ms":10}"#))
            .is_empty());
    }

    #[test]
    fn test_truncate_message() {
        let long = "x".repeat(500);
        let cut = truncate_message(&long);
        assert_eq!(cut.chars().count(), MAX_PROVIDER_MESSAGE_CHARS + 1);
        assert_eq!(truncate_message("line\nbreak"), "linebreak");
    }

    #[test]
    fn test_session_config_from_options() {
        let config = OpenAiConnector::build_session_config(&link_options());
        assert_eq!(config.voice, "verse");
        assert!(config.turn_detection.is_none());
        assert_eq!(config.instructions.as_deref(), Some("You are Dr. Sarah."));
        assert_eq!(config.input_audio_transcription.model, "whisper-1");
    }

    #[tokio::test]
    async fn test_open_rejects_other_providers() {
        let connector = OpenAiConnector::new("ws://127.0.0.1:9", Duration::from_millis(10));
        let options = LinkOptions {
            provider: Provider::Gemini,
            ..link_options()
        };
        let err = connector.open(options).await.err().unwrap();
        assert!(matches!(err, RealtimeError::UnsupportedProvider(_)));
    }

    #[test]
    fn test_ws_url_includes_model() {
        let connector = OpenAiConnector::new("wss://example.test/v1/realtime", Duration::ZERO);
        assert_eq!(
            connector.build_ws_url("gpt-4o-realtime-preview").unwrap(),
            "wss://example.test/v1/realtime?model=gpt-4o-realtime-preview"
        );
    }

    #[test]
    fn test_ws_url_encodes_model() {
        let connector = OpenAiConnector::new("wss://example.test/v1/realtime", Duration::ZERO);
        let url = connector.build_ws_url("x&foo=bar").unwrap();
        assert_eq!(url, "wss://example.test/v1/realtime?model=x%26foo%3Dbar");

        let parsed = reqwest::Url::parse(&url).unwrap();
        let pairs: Vec<_> = parsed.query_pairs().into_owned().collect();
        assert_eq!(pairs, vec![("model".to_string(), "x&foo=bar".to_string())]);
    }

    #[test]
    fn test_ws_url_rejects_malformed_base() {
        let connector = OpenAiConnector::new("not a url", Duration::ZERO);
        assert!(matches!(
            connector.build_ws_url("m"),
            Err(RealtimeError::InvalidConfiguration(_))
        ));
    }
}
