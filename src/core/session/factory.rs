//! Per-session provider construction.
//!
//! Each session gets its own provider set so cancellation and reconnect
//! state never crosses call boundaries. Tests substitute stub factories.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::core::recognition::{RecognitionConfig, RecognitionProvider, WsRecognition};
use crate::core::responder::{HttpResponder, ResponderConfig, ResponseGenerator};
use crate::core::synthesis::{SynthesisConfig, SynthesisProvider, WsSynthesis};

use super::registry::SessionError;

/// Provider set owned by one session.
pub struct SessionComponents {
    pub recognition: Box<dyn RecognitionProvider>,
    pub synthesis: Box<dyn SynthesisProvider>,
    pub responder: Arc<dyn ResponseGenerator>,
}

/// Builds the provider set for a new session.
pub trait ProviderFactory: Send + Sync {
    fn components(&self) -> Result<SessionComponents, SessionError>;
}

/// Production factory: WebSocket recognition/synthesis clients and the
/// streaming chat-completions responder, configured from [`ServerConfig`].
pub struct WsProviderFactory {
    config: Arc<ServerConfig>,
}

impl WsProviderFactory {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }
}

impl ProviderFactory for WsProviderFactory {
    fn components(&self) -> Result<SessionComponents, SessionError> {
        let session = &self.config.session;

        let recognition = WsRecognition::new(RecognitionConfig {
            endpoint: self.config.recognition_url.clone(),
            api_key: self.config.recognition_api_key.clone(),
            language: session.language.clone(),
            sample_rate: session.sample_rate,
            encoding: "linear16".to_string(),
            interim_results: true,
        })
        .map_err(|e| SessionError::Startup(e.to_string()))?;

        let synthesis = WsSynthesis::new(SynthesisConfig {
            endpoint: self.config.synthesis_url.clone(),
            api_key: self.config.synthesis_api_key.clone(),
            voice_id: self.config.synthesis_voice_id.clone(),
            encoding: "linear16".to_string(),
            sample_rate: session.sample_rate,
        })
        .map_err(|e| SessionError::Startup(e.to_string()))?;

        let responder = HttpResponder::new(ResponderConfig {
            endpoint: self.config.responder_url.clone(),
            api_key: self.config.responder_api_key.clone(),
            model: self.config.responder_model.clone(),
            system_prompt: self.config.system_prompt.clone(),
            first_chunk_timeout: session.first_chunk_timeout(),
            request_timeout: session.request_timeout(),
            end_marker: session.end_marker.clone(),
        });

        Ok(SessionComponents {
            recognition: Box::new(recognition),
            synthesis: Box::new(synthesis),
            responder: Arc::new(responder),
        })
    }
}
