//! Speech synthesis: provider seam, WebSocket client, and the per-call
//! episode manager.

pub mod base;
pub mod manager;
pub mod ws;

pub use base::{ProviderAudio, SynthesisChunk, SynthesisError, SynthesisProvider};
pub use manager::{SynthesisEvent, SynthesisStreamManager};
pub use ws::{SynthesisConfig, WsSynthesis};
