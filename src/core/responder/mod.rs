//! Response generator adapter.
//!
//! Bridges a finalized caller utterance (plus short dialogue context) to the
//! language-model backend and exposes the reply as a lazy, ordered sequence
//! of [`ResponseChunk`]s. At most one generation is outstanding per session;
//! the turn manager never overlaps requests by construction, but the
//! contract is enforced here with an in-flight guard.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::dialogue::{DialogueTurn, Speaker};

/// Text fragment of a reply, ordered by arrival.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseChunk {
    pub text: String,
    /// Mirrors streaming completion: set on the terminal chunk.
    pub is_final: bool,
    /// The model asked to end the call (end-of-call marker detected).
    pub end_of_call: bool,
}

/// Error types for response generation
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResponderError {
    #[error("no reply from language model within {0:?}")]
    ProviderTimeout(Duration),
    #[error("language model request failed: {0}")]
    ProviderError(String),
    #[error("a generation is already in flight")]
    Busy,
}

/// Lazy reply sequence: chunks in order, one terminal item.
pub type ResponseStream = mpsc::Receiver<Result<ResponseChunk, ResponderError>>;

/// Language-model backend seam.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Start one generation. Fails with [`ResponderError::Busy`] while a
    /// previous generation is still outstanding; dropping the returned
    /// stream cancels the request.
    async fn generate(
        &self,
        context: Vec<DialogueTurn>,
        utterance: &str,
    ) -> Result<ResponseStream, ResponderError>;
}

/// Configuration for [`HttpResponder`].
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Chat-completions endpoint, e.g. `https://llm.example.com/v1/chat/completions`.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    /// Persona and conversation-goal instructions sent as the system message.
    pub system_prompt: String,
    /// Fatal threshold: bounded wait for the first reply chunk.
    pub first_chunk_timeout: Duration,
    /// Upper bound on the whole streaming request.
    pub request_timeout: Duration,
    /// Marker the model embeds to request a hangup; stripped from the spoken
    /// text. Empty disables marker handling.
    pub end_marker: String,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    delta: ChatDelta,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

/// Streaming chat-completions client implementing [`ResponseGenerator`].
pub struct HttpResponder {
    client: reqwest::Client,
    config: ResponderConfig,
    busy: Arc<AtomicBool>,
}

impl HttpResponder {
    pub fn new(config: ResponderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    fn build_messages(&self, context: &[DialogueTurn], utterance: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(context.len() + 2);
        if !self.config.system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: self.config.system_prompt.clone(),
            });
        }
        for turn in context {
            messages.push(ChatMessage {
                role: match turn.speaker {
                    Speaker::Caller => "user",
                    Speaker::System => "assistant",
                },
                content: turn.text.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: utterance.to_string(),
        });
        messages
    }
}

/// Clears the in-flight flag when the generation task ends, however it ends.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[async_trait]
impl ResponseGenerator for HttpResponder {
    async fn generate(
        &self,
        context: Vec<DialogueTurn>,
        utterance: &str,
    ) -> Result<ResponseStream, ResponderError> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(ResponderError::Busy);
        }
        let guard = InFlightGuard(self.busy.clone());

        let body = ChatRequest {
            model: self.config.model.clone(),
            messages: self.build_messages(&context, utterance),
            stream: true,
        };
        let request = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .timeout(self.config.request_timeout)
            .json(&body);

        let (chunk_tx, chunk_rx) = mpsc::channel(32);
        let first_chunk_timeout = self.config.first_chunk_timeout;
        let end_marker = self.config.end_marker.clone();

        tokio::spawn(async move {
            let _guard = guard;
            run_generation(request, first_chunk_timeout, end_marker, chunk_tx).await;
        });

        Ok(chunk_rx)
    }
}

async fn run_generation(
    request: reqwest::RequestBuilder,
    first_chunk_timeout: Duration,
    end_marker: String,
    chunk_tx: mpsc::Sender<Result<ResponseChunk, ResponderError>>,
) {
    let response = match timeout(first_chunk_timeout, request.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            let _ = chunk_tx
                .send(Err(ResponderError::ProviderError(e.to_string())))
                .await;
            return;
        }
        Err(_) => {
            let _ = chunk_tx
                .send(Err(ResponderError::ProviderTimeout(first_chunk_timeout)))
                .await;
            return;
        }
    };

    if !response.status().is_success() {
        let _ = chunk_tx
            .send(Err(ResponderError::ProviderError(format!(
                "backend returned {}",
                response.status()
            ))))
            .await;
        return;
    }

    let mut events = Box::pin(response.bytes_stream().eventsource());
    let mut assembler = MarkerAssembler::new(end_marker);
    let mut first = true;

    loop {
        let next = if first {
            match timeout(first_chunk_timeout, events.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let _ = chunk_tx
                        .send(Err(ResponderError::ProviderTimeout(first_chunk_timeout)))
                        .await;
                    return;
                }
            }
        } else {
            events.next().await
        };

        match next {
            Some(Ok(event)) => {
                if event.data.trim() == "[DONE]" {
                    break;
                }
                let parsed: ChatChunk = match serde_json::from_str(&event.data) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!("skipping unparseable reply chunk: {e}");
                        continue;
                    }
                };
                let Some(content) = parsed
                    .choices
                    .first()
                    .and_then(|choice| choice.delta.content.as_deref())
                else {
                    continue;
                };
                first = false;

                let emitted = assembler.push(content);
                if !emitted.is_empty()
                    && chunk_tx
                        .send(Ok(ResponseChunk {
                            text: emitted,
                            is_final: false,
                            end_of_call: false,
                        }))
                        .await
                        .is_err()
                {
                    // Consumer dropped the stream: generation cancelled.
                    return;
                }
                if assembler.ended() {
                    break;
                }
            }
            Some(Err(e)) => {
                let _ = chunk_tx
                    .send(Err(ResponderError::ProviderError(format!(
                        "reply stream error: {e}"
                    ))))
                    .await;
                return;
            }
            None => break,
        }
    }

    if first {
        // Stream closed without a single content delta.
        warn!("language model reply contained no content");
    }
    let leftover = assembler.flush();
    let _ = chunk_tx
        .send(Ok(ResponseChunk {
            text: leftover,
            is_final: true,
            end_of_call: assembler.ended(),
        }))
        .await;
}

/// Streams reply text through while scanning for the end-of-call marker.
///
/// A suffix that could be the start of the marker is held back so a marker
/// split across chunk boundaries is never spoken.
struct MarkerAssembler {
    marker: String,
    held: String,
    ended: bool,
}

impl MarkerAssembler {
    fn new(marker: String) -> Self {
        Self {
            marker,
            held: String::new(),
            ended: false,
        }
    }

    fn push(&mut self, text: &str) -> String {
        if self.ended {
            return String::new();
        }
        if self.marker.is_empty() {
            return text.to_string();
        }

        self.held.push_str(text);
        if let Some(idx) = self.held.find(&self.marker) {
            self.ended = true;
            let out = self.held[..idx].to_string();
            self.held.clear();
            return out;
        }

        let keep = self.holdback_len();
        let split = self.held.len() - keep;
        let tail = self.held.split_off(split);
        std::mem::replace(&mut self.held, tail)
    }

    fn flush(&mut self) -> String {
        if self.ended {
            self.held.clear();
            return String::new();
        }
        std::mem::take(&mut self.held)
    }

    fn ended(&self) -> bool {
        self.ended
    }

    fn holdback_len(&self) -> usize {
        let max = self.marker.len().saturating_sub(1).min(self.held.len());
        for len in (1..=max).rev() {
            let start = self.held.len() - len;
            if !self.held.is_char_boundary(start) {
                continue;
            }
            if self.marker.starts_with(&self.held[start..]) {
                return len;
            }
        }
        0
    }
}
