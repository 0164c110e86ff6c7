use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::shared::models::TranscriptionFailureReason;

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderWord {
    pub word: String,
    /// Milliseconds from the start of the session's audio stream.
    pub start_ms: i64,
    pub end_ms: i64,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Interim hypothesis; superseded by the next partial or final.
    Partial { transcript: String },
    Final {
        transcript: String,
        words: Vec<ProviderWord>,
        /// Segment start within the session's audio stream.
        start_ms: i64,
        duration_ms: i64,
    },
    Error {
        reason: TranscriptionFailureReason,
        detail: String,
    },
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    #[error("provider connect failed: {0}")]
    Connect(String),
    #[error("provider stream closed")]
    StreamClosed,
    #[error("missing transcription credentials")]
    MissingCredentials,
}

/// Audio-in half of a streaming session.
#[async_trait]
pub trait SessionSink: Send {
    async fn send(&mut self, pcm_s16le: Bytes) -> Result<(), TranscriptionError>;
    /// Signal end of audio; the provider flushes pending finals before
    /// emitting `Closed`.
    async fn close(&mut self) -> Result<(), TranscriptionError>;
}

pub struct Session {
    pub sink: Box<dyn SessionSink>,
    pub events: mpsc::Receiver<ProviderEvent>,
}

/// A streaming ASR backend. One session per active speaker.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    async fn open(&self, language: &str, sample_rate: u32) -> Result<Session, TranscriptionError>;
}
