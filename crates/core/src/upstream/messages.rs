//! OpenAI Realtime wire messages (beta protocol, `OpenAI-Beta: realtime=v1`).
//!
//! Only the events this bridge sends or reacts to are modelled. Any other
//! server event deserializes to [`ServerEvent::Unknown`].

use serde::{Deserialize, Serialize};

// =============================================================================
// Client events
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub voice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: InputAudioTranscription,
    /// `None` serializes as `null`, which disables provider-side VAD.
    pub turn_detection: Option<TurnDetection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputAudioTranscription {
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetection {
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
}

impl ConversationItem {
    pub fn user_text(text: String) -> Self {
        Self {
            item_type: "message".to_string(),
            role: "user".to_string(),
            content: vec![ContentPart::InputText { text }],
        }
    }
}

/// Events sent to the provider.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate {
        event_id: String,
        session: SessionConfig,
    },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { event_id: String, audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit { event_id: String },
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate {
        event_id: String,
        item: ConversationItem,
    },
    #[serde(rename = "response.create")]
    ResponseCreate { event_id: String },
}

impl ClientEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioBufferCommit { .. } => "input_audio_buffer.commit",
            ClientEvent::ConversationItemCreate { .. } => "conversation.item.create",
            ClientEvent::ResponseCreate { .. } => "response.create",
        }
    }
}

pub fn new_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// =============================================================================
// Server events
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetails {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl ErrorDetails {
    /// Whether the provider rejected our credential.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self.code.as_deref(),
            Some("invalid_api_key") | Some("invalid_authentication") | Some("unauthorized")
        ) || self.error_type == "authentication_error"
    }
}

/// Events received from the provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },
    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionInfo },
    #[serde(rename = "error")]
    Error { error: ErrorDetails },
    #[serde(rename = "response.created")]
    ResponseCreated {},
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "response.audio.done")]
    AudioDone {},
    #[serde(rename = "response.text.delta")]
    TextDelta { delta: String },
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    InputTranscriptionDelta { delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted { transcript: String },
    #[serde(rename = "response.done")]
    ResponseDone {},
    #[serde(other)]
    Unknown,
}
