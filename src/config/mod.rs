//! Server and session configuration.
//!
//! Everything the orchestrator core consumes is collected into one immutable
//! [`SessionConfig`] handed to each session at creation; provider endpoints
//! and credentials live on [`ServerConfig`].

use std::env;
use std::time::Duration;

use crate::core::retry::RetryPolicy;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly customer support voice agent. \
Keep your sentences short and conversational, ask one question at a time, and never \
use emojis or formatting. When the conversation is finished, include [END_CALL] at \
the end of your last message.";

/// Turn-discipline and resource knobs for one call session.
///
/// The exact end-of-utterance silence threshold and barge-in responsiveness
/// budget have no single correct value; they are tunable policy, not
/// constants.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Silence after a final transcript segment before the turn is committed.
    pub silence_threshold_ms: u64,
    /// Hard upper bound on one caller utterance.
    pub utterance_hard_timeout_ms: u64,
    /// No caller input at all before the session says goodbye.
    pub idle_timeout_ms: u64,
    /// Fatal threshold for the first reply chunk from the language model.
    pub first_chunk_timeout_ms: u64,
    /// Upper bound on a whole language-model request.
    pub request_timeout_ms: u64,
    /// Barge-in responsiveness budget for synthesis cancellation.
    pub cancel_budget_ms: u64,
    /// Reconnect budget for the recognition stream.
    pub reconnect_max_attempts: u32,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    /// Dialogue-context retention cap (turns, oldest evicted first).
    pub context_max_turns: usize,
    /// Audio bus capacity in frames (a few seconds at 20 ms frames).
    pub audio_bus_capacity: usize,
    /// Utterance replay window for recognition reconnects, in frames.
    pub replay_limit: usize,
    /// Inbound/outbound audio sample rate in Hz.
    pub sample_rate: u32,
    /// Recognition language code.
    pub language: String,
    /// Opening line spoken when the call starts; `None` starts listening.
    pub greeting: Option<String>,
    /// Spoken when the language model fails or times out.
    pub fallback_phrase: String,
    /// Spoken before an orchestrator-initiated hangup.
    pub farewell_phrase: String,
    /// Marker the model embeds to end the call; stripped before synthesis.
    pub end_marker: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: 800,
            utterance_hard_timeout_ms: 6000,
            idle_timeout_ms: 30_000,
            first_chunk_timeout_ms: 5000,
            request_timeout_ms: 30_000,
            cancel_budget_ms: 250,
            reconnect_max_attempts: 3,
            reconnect_initial_backoff_ms: 250,
            reconnect_max_backoff_ms: 4000,
            context_max_turns: 16,
            audio_bus_capacity: 256,
            replay_limit: 256,
            sample_rate: 16_000,
            language: "en-US".to_string(),
            greeting: Some("Hello! How can I help you today?".to_string()),
            fallback_phrase:
                "Sorry, I'm having trouble answering right now. Could you say that again?"
                    .to_string(),
            farewell_phrase: "Thank you for calling. Goodbye!".to_string(),
            end_marker: "[END_CALL]".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn silence_threshold(&self) -> Duration {
        Duration::from_millis(self.silence_threshold_ms)
    }

    pub fn utterance_hard_timeout(&self) -> Duration {
        Duration::from_millis(self.utterance_hard_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn first_chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.first_chunk_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cancel_budget(&self) -> Duration {
        Duration::from_millis(self.cancel_budget_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.reconnect_max_attempts,
            initial_backoff: Duration::from_millis(self.reconnect_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.reconnect_max_backoff_ms),
        }
    }
}

/// Process-wide configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub recognition_url: String,
    pub recognition_api_key: String,
    pub synthesis_url: String,
    pub synthesis_api_key: String,
    pub synthesis_voice_id: Option<String>,
    pub responder_url: String,
    pub responder_api_key: String,
    pub responder_model: String,
    pub system_prompt: String,
    pub session: SessionConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables, with sensible
    /// defaults. Also loads from a `.env` file if present.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let _ = dotenvy::dotenv();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3002".to_string())
            .parse::<u16>()
            .map_err(|e| format!("Invalid port number: {e}"))?;

        let recognition_url = env::var("RECOGNITION_URL")
            .unwrap_or_else(|_| "wss://recognition.invalid/v1/listen".to_string());
        let recognition_api_key = env::var("RECOGNITION_API_KEY").unwrap_or_default();
        let synthesis_url = env::var("SYNTHESIS_URL")
            .unwrap_or_else(|_| "wss://synthesis.invalid/v1/speak".to_string());
        let synthesis_api_key = env::var("SYNTHESIS_API_KEY").unwrap_or_default();
        let synthesis_voice_id = env::var("SYNTHESIS_VOICE_ID").ok();
        let responder_url = env::var("RESPONDER_URL")
            .unwrap_or_else(|_| "https://llm.invalid/v1/chat/completions".to_string());
        let responder_api_key = env::var("RESPONDER_API_KEY").unwrap_or_default();
        let responder_model =
            env::var("RESPONDER_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let system_prompt =
            env::var("SYSTEM_PROMPT").unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.to_string());

        let defaults = SessionConfig::default();
        let session = SessionConfig {
            silence_threshold_ms: env_u64("SILENCE_THRESHOLD_MS", defaults.silence_threshold_ms)?,
            utterance_hard_timeout_ms: env_u64(
                "UTTERANCE_HARD_TIMEOUT_MS",
                defaults.utterance_hard_timeout_ms,
            )?,
            idle_timeout_ms: env_u64("IDLE_TIMEOUT_MS", defaults.idle_timeout_ms)?,
            first_chunk_timeout_ms: env_u64(
                "RESPONDER_FIRST_CHUNK_TIMEOUT_MS",
                defaults.first_chunk_timeout_ms,
            )?,
            request_timeout_ms: env_u64(
                "RESPONDER_REQUEST_TIMEOUT_MS",
                defaults.request_timeout_ms,
            )?,
            cancel_budget_ms: env_u64("CANCEL_BUDGET_MS", defaults.cancel_budget_ms)?,
            reconnect_max_attempts: env_u64(
                "RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect_max_attempts as u64,
            )? as u32,
            reconnect_initial_backoff_ms: env_u64(
                "RECONNECT_INITIAL_BACKOFF_MS",
                defaults.reconnect_initial_backoff_ms,
            )?,
            reconnect_max_backoff_ms: env_u64(
                "RECONNECT_MAX_BACKOFF_MS",
                defaults.reconnect_max_backoff_ms,
            )?,
            context_max_turns: env_u64("CONTEXT_MAX_TURNS", defaults.context_max_turns as u64)?
                as usize,
            audio_bus_capacity: env_u64("AUDIO_BUS_CAPACITY", defaults.audio_bus_capacity as u64)?
                as usize,
            replay_limit: env_u64("REPLAY_LIMIT", defaults.replay_limit as u64)? as usize,
            sample_rate: env_u64("SAMPLE_RATE", defaults.sample_rate as u64)? as u32,
            language: env::var("LANGUAGE").unwrap_or(defaults.language),
            greeting: match env::var("GREETING") {
                Ok(greeting) if greeting.is_empty() => None,
                Ok(greeting) => Some(greeting),
                Err(_) => defaults.greeting,
            },
            fallback_phrase: env::var("FALLBACK_PHRASE").unwrap_or(defaults.fallback_phrase),
            farewell_phrase: env::var("FAREWELL_PHRASE").unwrap_or(defaults.farewell_phrase),
            end_marker: env::var("END_MARKER").unwrap_or(defaults.end_marker),
        };

        Ok(Self {
            host,
            port,
            recognition_url,
            recognition_api_key,
            synthesis_url,
            synthesis_api_key,
            synthesis_voice_id,
            responder_url,
            responder_api_key,
            responder_model,
            system_prompt,
            session,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64, Box<dyn std::error::Error>> {
    match env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .map_err(|e| format!("Invalid {name}: {e}").into()),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn cleanup_env_vars() {
        unsafe {
            env::remove_var("HOST");
            env::remove_var("PORT");
            env::remove_var("SILENCE_THRESHOLD_MS");
            env::remove_var("GREETING");
            env::remove_var("CONTEXT_MAX_TURNS");
        }
    }

    #[test]
    #[serial]
    fn from_env_defaults() {
        cleanup_env_vars();

        let config = ServerConfig::from_env().expect("should load config");
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3002);
        assert_eq!(config.session.silence_threshold_ms, 800);
        assert_eq!(config.session.context_max_turns, 16);
        assert!(config.session.greeting.is_some());

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn from_env_overrides_and_empty_greeting_disables_it() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "9100");
            env::set_var("SILENCE_THRESHOLD_MS", "450");
            env::set_var("GREETING", "");
        }

        let config = ServerConfig::from_env().expect("should load config");
        assert_eq!(config.port, 9100);
        assert_eq!(config.session.silence_threshold_ms, 450);
        assert!(config.session.greeting.is_none());

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn from_env_rejects_malformed_numbers() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "not-a-port");
        }
        assert!(ServerConfig::from_env().is_err());
        cleanup_env_vars();
    }

    #[test]
    fn retry_policy_mirrors_session_fields() {
        let session = SessionConfig::default();
        let policy = session.retry_policy();
        assert_eq!(policy.max_attempts, session.reconnect_max_attempts);
        assert_eq!(
            policy.initial_backoff,
            Duration::from_millis(session.reconnect_initial_backoff_ms)
        );
    }
}
