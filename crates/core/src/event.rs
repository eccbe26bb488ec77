//! Normalized, provider-agnostic events fanned out to session subscribers.

use crate::error::{ErrorKind, RealtimeError};
use serde::Serialize;
use std::{fmt, str::FromStr};

/// The kinds of event a subscriber can listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionReady,
    AssistantAudioDelta,
    AssistantTextDelta,
    AssistantSpeechStarted,
    AssistantSpeechStopped,
    UserTranscriptDelta,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::SessionReady,
        EventKind::AssistantAudioDelta,
        EventKind::AssistantTextDelta,
        EventKind::AssistantSpeechStarted,
        EventKind::AssistantSpeechStopped,
        EventKind::UserTranscriptDelta,
        EventKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionReady => "session_ready",
            EventKind::AssistantAudioDelta => "assistant_audio_delta",
            EventKind::AssistantTextDelta => "assistant_text_delta",
            EventKind::AssistantSpeechStarted => "assistant_speech_started",
            EventKind::AssistantSpeechStopped => "assistant_speech_stopped",
            EventKind::UserTranscriptDelta => "user_transcript_delta",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('-', "_");
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| RealtimeError::InvalidInput(format!("unknown event kind '{s}'")))
    }
}

/// A single event delivered to subscribers. Serialized with a `type` tag that
/// matches [`EventKind::as_str`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SessionReady {
        session_id: String,
        provider: String,
        model: String,
    },
    /// Base64-encoded PCM16 audio from the assistant.
    AssistantAudioDelta { audio: String },
    AssistantTextDelta { text: String },
    AssistantSpeechStarted,
    AssistantSpeechStopped,
    UserTranscriptDelta { text: String, is_final: bool },
    Error { code: ErrorKind, message: String },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::SessionReady { .. } => EventKind::SessionReady,
            Event::AssistantAudioDelta { .. } => EventKind::AssistantAudioDelta,
            Event::AssistantTextDelta { .. } => EventKind::AssistantTextDelta,
            Event::AssistantSpeechStarted => EventKind::AssistantSpeechStarted,
            Event::AssistantSpeechStopped => EventKind::AssistantSpeechStopped,
            Event::UserTranscriptDelta { .. } => EventKind::UserTranscriptDelta,
            Event::Error { .. } => EventKind::Error,
        }
    }

    pub fn from_error(err: &RealtimeError) -> Self {
        Event::Error {
            code: err.kind(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_serialized_tag() {
        let events = vec![
            Event::SessionReady {
                session_id: "s".into(),
                provider: "openai".into(),
                model: "m".into(),
            },
            Event::AssistantAudioDelta { audio: "AAA=".into() },
            Event::AssistantTextDelta { text: "hi".into() },
            Event::AssistantSpeechStarted,
            Event::AssistantSpeechStopped,
            Event::UserTranscriptDelta {
                text: "hello".into(),
                is_final: true,
            },
            Event::from_error(&RealtimeError::UpstreamUnavailable("reset".into())),
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.kind().as_str());
        }
    }

    #[test]
    fn test_event_kind_parsing() {
        assert_eq!(
            "assistant_audio_delta".parse::<EventKind>().unwrap(),
            EventKind::AssistantAudioDelta
        );
        assert_eq!(
            "user-transcript-delta".parse::<EventKind>().unwrap(),
            EventKind::UserTranscriptDelta
        );
        assert!(matches!(
            "bogus".parse::<EventKind>(),
            Err(RealtimeError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_error_event_payload() {
        let event = Event::from_error(&RealtimeError::AuthenticationFailed("bad key".into()));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["code"], "authentication_failed");
        assert_eq!(json["message"], "Authentication failed: bad key");
    }
}
