//! Per-turn accumulation of user audio.

use base64::Engine;
use bytes::{Bytes, BytesMut};

use crate::error::{RealtimeError, RealtimeResult};

/// Decodes a base64 chunk received at the transport boundary into raw PCM bytes.
pub fn decode_chunk(base64_chunk: &str) -> RealtimeResult<Bytes> {
    let trimmed = base64_chunk.trim();
    if trimmed.is_empty() {
        return Err(RealtimeError::InvalidInput(
            "audio chunk must not be empty".to_string(),
        ));
    }
    base64::engine::general_purpose::STANDARD
        .decode(trimmed)
        .map(Bytes::from)
        .map_err(|e| RealtimeError::InvalidInput(format!("audio chunk is not valid base64: {e}")))
}

/// Encodes raw PCM bytes for the provider wire or an SSE payload.
pub fn encode_chunk(pcm: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(pcm)
}

/// Summary of what a commit flushed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommittedTurn {
    pub chunks: usize,
    pub bytes: usize,
    /// All chunks of the turn, concatenated in append order.
    pub audio: Bytes,
}

/// Ordered audio chunks appended since the previous commit.
#[derive(Debug, Default)]
pub struct AudioTurnBuffer {
    chunks: Vec<Bytes>,
    bytes: usize,
}

impl AudioTurnBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, chunk: Bytes) {
        self.bytes += chunk.len();
        self.chunks.push(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    /// Drains the buffer, leaving it empty.
    pub fn take_turn(&mut self) -> CommittedTurn {
        let chunks = std::mem::take(&mut self.chunks);
        let bytes = std::mem::replace(&mut self.bytes, 0);
        let mut audio = BytesMut::with_capacity(bytes);
        for chunk in &chunks {
            audio.extend_from_slice(chunk);
        }
        CommittedTurn {
            chunks: chunks.len(),
            bytes,
            audio: audio.freeze(),
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }
}
