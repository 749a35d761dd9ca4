//! Transport boundary.
//!
//! The orchestrator only ever talks to the telephony side through this seam:
//! synthesized audio goes out with `send_audio`, and `hangup` asks the
//! transport to end the call. The inbound half (`on_call_start`, `on_audio`,
//! `on_call_end`) is realized by the WebSocket handler driving the session
//! registry.

use async_trait::async_trait;

use crate::core::synthesis::SynthesisChunk;

/// Outbound half of the transport adapter.
#[async_trait]
pub trait TransportSink: Send + Sync {
    /// Deliver one chunk of synthesized audio to the caller. Delivery
    /// failures are the transport's concern; the orchestrator does not
    /// retry audio.
    async fn send_audio(&self, call_id: &str, chunk: SynthesisChunk);

    /// Ask the transport to end the call.
    async fn hangup(&self, call_id: &str);
}
