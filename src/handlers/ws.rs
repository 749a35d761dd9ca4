//! WebSocket transport adapter.
//!
//! One WebSocket connection carries one call: binary frames are caller
//! audio (`on_audio`), the upgrade itself is `on_call_start`, and a close or
//! a `hangup` command is `on_call_end`. Synthesized audio flows back as
//! binary frames; control notices are JSON text messages.

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::audio::AudioBusError;
use crate::core::synthesis::SynthesisChunk;
use crate::core::turn::TurnState;
use crate::state::AppState;
use crate::transport::TransportSink;

/// Commands a transport client may send as JSON text frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CallCommand {
    Hangup,
}

/// Notices sent to the transport client as JSON text frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CallNotice {
    Accepted { call_id: String, stream_id: String },
    /// The audio bus is full; the transport should apply flow control.
    Backpressure,
    Hangup,
    Error { message: String },
}

/// Frames routed to the socket sender task.
enum OutboundFrame {
    Audio(bytes::Bytes),
    Notice(CallNotice),
    Hangup,
}

/// Outbound half of the transport for one WebSocket call.
struct WsTransport {
    out_tx: mpsc::UnboundedSender<OutboundFrame>,
}

#[async_trait::async_trait]
impl TransportSink for WsTransport {
    async fn send_audio(&self, call_id: &str, chunk: SynthesisChunk) {
        if self.out_tx.send(OutboundFrame::Audio(chunk.payload)).is_err() {
            debug!(call_id, "transport gone, dropping synthesized audio");
        }
    }

    async fn hangup(&self, call_id: &str) {
        debug!(call_id, "orchestrator requested hangup");
        let _ = self.out_tx.send(OutboundFrame::Hangup);
    }
}

/// Upgrade handler: one call session per socket.
pub async fn ws_call_handler(
    ws: WebSocketUpgrade,
    Path(call_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    info!(call_id, "call transport connecting");
    ws.on_upgrade(move |socket| handle_call_socket(socket, call_id, state))
}

async fn handle_call_socket(socket: WebSocket, call_id: String, app_state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let transport = Arc::new(WsTransport {
        out_tx: out_tx.clone(),
    });

    let session = match app_state.registry.create(&call_id, transport).await {
        Ok(session) => session,
        Err(e) => {
            warn!(call_id, "call rejected: {e}");
            let notice = CallNotice::Error {
                message: e.to_string(),
            };
            if let Ok(text) = serde_json::to_string(&notice) {
                let _ = sender.send(Message::Text(text.into())).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let stream_id = uuid::Uuid::new_v4().to_string();
    let _ = out_tx.send(OutboundFrame::Notice(CallNotice::Accepted {
        call_id: call_id.clone(),
        stream_id,
    }));

    // Outgoing frames are serialized by a dedicated task so synthesis
    // delivery never contends with the receive loop.
    let sender_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let result = match frame {
                OutboundFrame::Audio(payload) => sender.send(Message::Binary(payload)).await,
                OutboundFrame::Notice(notice) => match serde_json::to_string(&notice) {
                    Ok(text) => sender.send(Message::Text(text.into())).await,
                    Err(e) => {
                        warn!("failed to serialize notice: {e}");
                        continue;
                    }
                },
                OutboundFrame::Hangup => {
                    if let Ok(text) = serde_json::to_string(&CallNotice::Hangup) {
                        let _ = sender.send(Message::Text(text.into())).await;
                    }
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = result {
                debug!("transport send failed: {e}");
                break;
            }
        }
    });

    let mut state_rx = session.state_receiver();
    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(message)) => {
                    if !process_message(message, &session, &out_tx).await {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(call_id, "transport receive error: {e}");
                    break;
                }
                None => {
                    info!(call_id, "transport closed the connection");
                    break;
                }
            },
            // The orchestrator ended the call (farewell complete, fatal
            // error); stop consuming audio for it.
            changed = async { state_rx.wait_for(|s| *s == TurnState::Ended).await.is_ok() } => {
                if changed {
                    info!(call_id, "session ended, closing transport");
                }
                break;
            }
        }
    }

    app_state.registry.destroy(&call_id).await;

    // Let the sender drain queued farewell audio and the close frame; the
    // channel closes once the session's transport handle is gone.
    drop(out_tx);
    let mut sender_task = sender_task;
    if tokio::time::timeout(std::time::Duration::from_secs(1), &mut sender_task)
        .await
        .is_err()
    {
        sender_task.abort();
    }
    info!(call_id, "call transport terminated");
}

/// Returns false when the call should end.
async fn process_message(
    message: Message,
    session: &Arc<crate::core::session::CallSession>,
    out_tx: &mpsc::UnboundedSender<OutboundFrame>,
) -> bool {
    match message {
        Message::Binary(data) => {
            match session.push_audio(data) {
                Ok(_) => {}
                Err(AudioBusError::Backpressure) => {
                    // Surfaced, never silently dropped: the transport decides
                    // whether to retry or thin out.
                    warn!(call_id = session.call_id(), "audio bus full, frame rejected");
                    let _ = out_tx.send(OutboundFrame::Notice(CallNotice::Backpressure));
                }
                Err(AudioBusError::Closed) => {
                    debug!(call_id = session.call_id(), "audio after session close");
                    return false;
                }
            }
            true
        }
        Message::Text(text) => match serde_json::from_str::<CallCommand>(text.as_str()) {
            Ok(CallCommand::Hangup) => {
                info!(call_id = session.call_id(), "transport sent hangup command");
                session.hangup();
                false
            }
            Err(e) => {
                let _ = out_tx.send(OutboundFrame::Notice(CallNotice::Error {
                    message: format!("invalid command: {e}"),
                }));
                true
            }
        },
        Message::Close(_) => {
            info!(call_id = session.call_id(), "transport close frame");
            false
        }
        Message::Ping(_) | Message::Pong(_) => true,
    }
}
