//! WebSocket speech-synthesis client.
//!
//! The provider accepts JSON commands (`Speak`, `Flush`, `Clear`, `Close`)
//! and streams back binary audio chunks, with a `Flushed` control message
//! marking completion of everything queued before the flush.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::base::{ProviderAudio, SynthesisError, SynthesisProvider};

/// Configuration for the synthesis WebSocket client.
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Provider endpoint, e.g. `wss://synthesis.example.com/v1/speak`.
    pub endpoint: String,
    pub api_key: String,
    /// Voice identifier understood by the provider.
    pub voice_id: Option<String>,
    /// Output audio encoding.
    pub encoding: String,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            voice_id: None,
            encoding: "linear16".to_string(),
            sample_rate: 16000,
        }
    }
}

/// Commands sent to the synthesis provider.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum SynthesisCommand {
    Speak { text: String },
    Flush,
    Clear,
    Close,
}

/// Control messages received from the synthesis provider.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum SynthesisControl {
    Flushed,
    Error { message: String },
}

/// WebSocket-backed [`SynthesisProvider`].
pub struct WsSynthesis {
    config: SynthesisConfig,
    command_tx: Option<mpsc::UnboundedSender<SynthesisCommand>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    audio_rx: Option<mpsc::UnboundedReceiver<ProviderAudio>>,
    connection_handle: Option<tokio::task::JoinHandle<()>>,
    ready: Arc<AtomicBool>,
}

impl WsSynthesis {
    pub fn new(config: SynthesisConfig) -> Result<Self, SynthesisError> {
        if config.endpoint.is_empty() {
            return Err(SynthesisError::ConfigurationError(
                "synthesis endpoint is required".to_string(),
            ));
        }
        Ok(Self {
            config,
            command_tx: None,
            shutdown_tx: None,
            audio_rx: None,
            connection_handle: None,
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    fn build_url(config: &SynthesisConfig) -> Result<Url, SynthesisError> {
        let mut url = Url::parse(&config.endpoint)
            .map_err(|e| SynthesisError::ConfigurationError(format!("invalid endpoint: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("encoding", &config.encoding)
                .append_pair("sample_rate", &config.sample_rate.to_string());
            if let Some(voice_id) = &config.voice_id {
                query.append_pair("voice_id", voice_id);
            }
        }
        Ok(url)
    }

    fn build_request(config: &SynthesisConfig) -> Result<Request<()>, SynthesisError> {
        let url = Self::build_url(config)?;
        let host = url
            .host_str()
            .ok_or_else(|| SynthesisError::ConfigurationError("endpoint has no host".to_string()))?
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
            .map_err(|e| SynthesisError::ConfigurationError(format!("invalid request: {e}")))
    }

    fn handle_control(text: &str, audio_tx: &mpsc::UnboundedSender<ProviderAudio>) {
        match serde_json::from_str::<SynthesisControl>(text) {
            Ok(SynthesisControl::Flushed) => {
                let _ = audio_tx.send(ProviderAudio::Flushed);
            }
            Ok(SynthesisControl::Error { message }) => {
                let _ = audio_tx.send(ProviderAudio::Error(message));
            }
            Err(e) => warn!("unparseable synthesis control message: {e}"),
        }
    }

    async fn send_command(&mut self, command: SynthesisCommand) -> Result<(), SynthesisError> {
        if !self.is_ready() {
            // Lazy (re)connect keeps session creation free of network I/O and
            // recovers a dropped link at the next use.
            self.connect().await?;
        }
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or_else(|| SynthesisError::NotReady("synthesis link not connected".to_string()))?;
        command_tx
            .send(command)
            .map_err(|_| SynthesisError::NotReady("synthesis link lost".to_string()))
    }
}

#[async_trait]
impl SynthesisProvider for WsSynthesis {
    async fn connect(&mut self) -> Result<(), SynthesisError> {
        let request = Self::build_request(&self.config)?;

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<SynthesisCommand>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let (audio_tx, audio_rx) = mpsc::unbounded_channel::<ProviderAudio>();
        let (connected_tx, connected_rx) = oneshot::channel::<Result<(), SynthesisError>>();

        let ready = self.ready.clone();
        let handle = tokio::spawn(async move {
            let (ws_stream, _) = match connect_async(request).await {
                Ok(result) => result,
                Err(e) => {
                    let _ =
                        connected_tx.send(Err(SynthesisError::ConnectionFailed(e.to_string())));
                    return;
                }
            };

            ready.store(true, Ordering::Release);
            if connected_tx.send(Ok(())).is_err() {
                ready.store(false, Ordering::Release);
                return;
            }
            info!("synthesis link established");

            let (mut sink, mut stream) = ws_stream.split();
            loop {
                tokio::select! {
                    command = command_rx.recv() => match command {
                        Some(command) => {
                            let payload = match serde_json::to_string(&command) {
                                Ok(payload) => payload,
                                Err(e) => {
                                    warn!("failed to encode synthesis command: {e}");
                                    continue;
                                }
                            };
                            if let Err(e) = sink.send(Message::Text(payload.into())).await {
                                warn!("failed to send synthesis command: {e}");
                                break;
                            }
                        }
                        None => break,
                    },
                    incoming = stream.next() => match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            let _ = audio_tx.send(ProviderAudio::Chunk(data));
                        }
                        Some(Ok(Message::Text(text))) => {
                            Self::handle_control(text.as_str(), &audio_tx);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("synthesis link closed by provider: {frame:?}");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("synthesis link error: {e}");
                            break;
                        }
                        None => {
                            info!("synthesis link ended");
                            break;
                        }
                    },
                    _ = &mut shutdown_rx => {
                        debug!("synthesis link shutting down");
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            ready.store(false, Ordering::Release);
        });

        match connected_rx.await {
            Ok(Ok(())) => {
                self.command_tx = Some(command_tx);
                self.shutdown_tx = Some(shutdown_tx);
                self.audio_rx = Some(audio_rx);
                self.connection_handle = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SynthesisError::ConnectionFailed(
                "connection task aborted".to_string(),
            )),
        }
    }

    async fn disconnect(&mut self) -> Result<(), SynthesisError> {
        if let Some(command_tx) = &self.command_tx {
            let _ = command_tx.send(SynthesisCommand::Close);
        }
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.connection_handle.take() {
            let _ = timeout(Duration::from_secs(2), handle).await;
        }
        self.command_tx = None;
        self.audio_rx = None;
        self.ready.store(false, Ordering::Release);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn speak(&mut self, text: &str) -> Result<(), SynthesisError> {
        self.send_command(SynthesisCommand::Speak {
            text: text.to_string(),
        })
        .await
    }

    async fn flush(&mut self) -> Result<(), SynthesisError> {
        self.send_command(SynthesisCommand::Flush).await
    }

    async fn clear(&mut self) -> Result<(), SynthesisError> {
        self.send_command(SynthesisCommand::Clear).await
    }

    fn audio(&mut self) -> Option<mpsc::UnboundedReceiver<ProviderAudio>> {
        self.audio_rx.take()
    }
}

impl Drop for WsSynthesis {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}
