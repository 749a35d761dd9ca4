//! Base abstractions for speech-recognition providers.
//!
//! Providers are modeled as a cancellable lazy sequence: each successful
//! `connect` yields a fresh segment stream, and the stream ending signals
//! that the provider link dropped. This keeps the stream manager free of
//! nested callbacks and lets it treat recognition and synthesis uniformly.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// One recognition result relative to the call audio clock.
///
/// Partial segments are advisory and may be superseded; final segments are
/// immutable once emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSegment {
    pub text: String,
    pub is_final: bool,
    pub start_ms: u64,
    pub end_ms: u64,
}

impl TranscriptSegment {
    pub fn partial(text: impl Into<String>, start_ms: u64, end_ms: u64) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            start_ms,
            end_ms,
        }
    }

    pub fn final_segment(text: impl Into<String>, start_ms: u64, end_ms: u64) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            start_ms,
            end_ms,
        }
    }
}

/// Error types for recognition operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RecognitionError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("recognition link disconnected: {0}")]
    Disconnected(String),
    #[error("provider error: {0}")]
    ProviderError(String),
    #[error("configuration error: {0}")]
    ConfigurationError(String),
}

/// Events surfaced by the recognition stream manager to the turn manager.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// Advisory partial transcript, used for barge-in detection.
    Partial(TranscriptSegment),
    /// Authoritative final transcript driving dialogue turns.
    Final(TranscriptSegment),
    /// The reconnect budget is exhausted; the session should wind down.
    Degraded,
}

/// Streaming speech-recognition provider seam.
#[async_trait]
pub trait RecognitionProvider: Send {
    /// Establish (or re-establish) the provider link. A successful call makes
    /// a fresh segment stream available through [`Self::segments`].
    async fn connect(&mut self) -> Result<(), RecognitionError>;

    /// Tear down the provider link.
    async fn disconnect(&mut self) -> Result<(), RecognitionError>;

    /// Whether the link is up and accepting audio.
    fn is_ready(&self) -> bool;

    /// Forward one frame of caller audio.
    async fn send_audio(&mut self, audio: Bytes) -> Result<(), RecognitionError>;

    /// Take the segment stream for the current connection. The stream ends
    /// when the provider link drops. Returns `None` if already taken or not
    /// connected.
    fn segments(&mut self) -> Option<mpsc::UnboundedReceiver<TranscriptSegment>>;
}
