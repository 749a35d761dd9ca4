//! Base abstractions for speech-synthesis providers.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// One chunk of synthesized audio, ordered within its episode.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisChunk {
    /// Episode the chunk belongs to; cancellation is scoped per episode.
    pub episode: u64,
    /// Ordered sequence number within the episode.
    pub seq: u64,
    pub payload: Bytes,
}

/// Error types for synthesis operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum SynthesisError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("provider not ready: {0}")]
    NotReady(String),
    #[error("provider error: {0}")]
    ProviderError(String),
    #[error("configuration error: {0}")]
    ConfigurationError(String),
}

/// Raw events on a synthesis provider link, before episode bookkeeping.
#[derive(Debug, Clone)]
pub enum ProviderAudio {
    /// Synthesized audio bytes, in order.
    Chunk(Bytes),
    /// All queued text up to the last flush has been synthesized.
    Flushed,
    /// The provider reported a failure for the in-flight synthesis.
    Error(String),
}

/// Streaming speech-synthesis provider seam.
///
/// `speak` queues text; `flush` asks the provider to synthesize everything
/// queued so far and emit [`ProviderAudio::Flushed`] once done; `clear`
/// drops queued text and pending audio (the cancellation primitive).
#[async_trait]
pub trait SynthesisProvider: Send {
    async fn connect(&mut self) -> Result<(), SynthesisError>;

    async fn disconnect(&mut self) -> Result<(), SynthesisError>;

    fn is_ready(&self) -> bool;

    async fn speak(&mut self, text: &str) -> Result<(), SynthesisError>;

    async fn flush(&mut self) -> Result<(), SynthesisError>;

    async fn clear(&mut self) -> Result<(), SynthesisError>;

    /// Take the audio stream for the current connection. The stream ends when
    /// the provider link drops.
    fn audio(&mut self) -> Option<mpsc::UnboundedReceiver<ProviderAudio>>;
}
