//! WebSocket speech-recognition client.
//!
//! Speaks the provider wire contract: binary audio frames upstream, JSON
//! `{text, is_final, start_ms, end_ms}` events downstream, in arrival order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::base::{RecognitionError, RecognitionProvider, TranscriptSegment};

/// Configuration for the recognition WebSocket client.
#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    /// Provider endpoint, e.g. `wss://recognition.example.com/v1/listen`.
    pub endpoint: String,
    pub api_key: String,
    /// Language code for transcription (e.g. "en-US").
    pub language: String,
    /// Sample rate of the inbound audio in Hz.
    pub sample_rate: u32,
    /// Audio encoding identifier understood by the provider.
    pub encoding: String,
    /// Whether to request advisory partial results.
    pub interim_results: bool,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            language: "en-US".to_string(),
            sample_rate: 16000,
            encoding: "linear16".to_string(),
            interim_results: true,
        }
    }
}

/// Transcript event as emitted by the provider.
#[derive(Debug, Deserialize)]
struct TranscriptEvent {
    text: String,
    is_final: bool,
    #[serde(default)]
    start_ms: u64,
    #[serde(default)]
    end_ms: u64,
}

/// WebSocket-backed [`RecognitionProvider`].
pub struct WsRecognition {
    config: RecognitionConfig,
    ws_tx: Option<mpsc::UnboundedSender<Message>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    segment_rx: Option<mpsc::UnboundedReceiver<TranscriptSegment>>,
    connection_handle: Option<tokio::task::JoinHandle<()>>,
    ready: Arc<AtomicBool>,
}

impl WsRecognition {
    pub fn new(config: RecognitionConfig) -> Result<Self, RecognitionError> {
        if config.endpoint.is_empty() {
            return Err(RecognitionError::ConfigurationError(
                "recognition endpoint is required".to_string(),
            ));
        }
        Ok(Self {
            config,
            ws_tx: None,
            shutdown_tx: None,
            segment_rx: None,
            connection_handle: None,
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Build the WebSocket URL with query parameters.
    fn build_url(config: &RecognitionConfig) -> Result<Url, RecognitionError> {
        let mut url = Url::parse(&config.endpoint)
            .map_err(|e| RecognitionError::ConfigurationError(format!("invalid endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("language", &config.language)
            .append_pair("sample_rate", &config.sample_rate.to_string())
            .append_pair("encoding", &config.encoding)
            .append_pair("interim_results", &config.interim_results.to_string());
        Ok(url)
    }

    fn build_request(config: &RecognitionConfig) -> Result<Request<()>, RecognitionError> {
        let url = Self::build_url(config)?;
        let host = url
            .host_str()
            .ok_or_else(|| {
                RecognitionError::ConfigurationError("endpoint has no host".to_string())
            })?
            .to_string();

        Request::builder()
            .uri(url.as_str())
            .header("Host", host)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Key", generate_key())
            .header("Sec-WebSocket-Version", "13")
            .header("Authorization", format!("Bearer {}", config.api_key))
            .body(())
            .map_err(|e| RecognitionError::ConfigurationError(format!("invalid request: {e}")))
    }

    fn handle_text_event(text: &str, segment_tx: &mpsc::UnboundedSender<TranscriptSegment>) {
        match serde_json::from_str::<TranscriptEvent>(text) {
            Ok(event) => {
                let segment = TranscriptSegment {
                    text: event.text,
                    is_final: event.is_final,
                    start_ms: event.start_ms,
                    end_ms: event.end_ms,
                };
                if segment_tx.send(segment).is_err() {
                    debug!("segment receiver dropped, discarding transcript");
                }
            }
            Err(e) => warn!("unparseable recognition event: {e}"),
        }
    }
}

#[async_trait]
impl RecognitionProvider for WsRecognition {
    async fn connect(&mut self) -> Result<(), RecognitionError> {
        let request = Self::build_request(&self.config)?;

        let (ws_tx, mut ws_rx) = mpsc::unbounded_channel::<Message>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let (segment_tx, segment_rx) = mpsc::unbounded_channel::<TranscriptSegment>();
        let (connected_tx, connected_rx) = oneshot::channel::<Result<(), RecognitionError>>();

        let ready = self.ready.clone();
        let handle = tokio::spawn(async move {
            let (ws_stream, _) = match connect_async(request).await {
                Ok(result) => result,
                Err(e) => {
                    let _ = connected_tx.send(Err(RecognitionError::ConnectionFailed(
                        e.to_string(),
                    )));
                    return;
                }
            };

            ready.store(true, Ordering::Release);
            if connected_tx.send(Ok(())).is_err() {
                ready.store(false, Ordering::Release);
                return;
            }
            info!("recognition link established");

            let (mut sink, mut stream) = ws_stream.split();
            loop {
                tokio::select! {
                    outgoing = ws_rx.recv() => match outgoing {
                        Some(message) => {
                            if let Err(e) = sink.send(message).await {
                                warn!("failed to send audio to recognition provider: {e}");
                                break;
                            }
                        }
                        None => break,
                    },
                    incoming = stream.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            Self::handle_text_event(text.as_str(), &segment_tx);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("recognition link closed by provider: {frame:?}");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("recognition link error: {e}");
                            break;
                        }
                        None => {
                            info!("recognition link ended");
                            break;
                        }
                    },
                    _ = &mut shutdown_rx => {
                        debug!("recognition link shutting down");
                        break;
                    }
                }
            }

            ready.store(false, Ordering::Release);
            // Dropping segment_tx ends the segment stream, which the stream
            // manager interprets as a provider disconnect.
        });

        match connected_rx.await {
            Ok(Ok(())) => {
                self.ws_tx = Some(ws_tx);
                self.shutdown_tx = Some(shutdown_tx);
                self.segment_rx = Some(segment_rx);
                self.connection_handle = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RecognitionError::ConnectionFailed(
                "connection task aborted".to_string(),
            )),
        }
    }

    async fn disconnect(&mut self) -> Result<(), RecognitionError> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.connection_handle.take() {
            let _ = timeout(Duration::from_secs(2), handle).await;
        }
        self.ws_tx = None;
        self.segment_rx = None;
        self.ready.store(false, Ordering::Release);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn send_audio(&mut self, audio: Bytes) -> Result<(), RecognitionError> {
        let ws_tx = self.ws_tx.as_ref().ok_or_else(|| {
            RecognitionError::Disconnected("recognition link not connected".to_string())
        })?;
        ws_tx
            .send(Message::Binary(audio))
            .map_err(|_| RecognitionError::Disconnected("recognition link lost".to_string()))
    }

    fn segments(&mut self) -> Option<mpsc::UnboundedReceiver<TranscriptSegment>> {
        self.segment_rx.take()
    }
}

impl Drop for WsRecognition {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}
