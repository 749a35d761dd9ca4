//! Call session: exclusive owner of all per-call resources.

pub mod factory;
pub mod registry;

pub use factory::{ProviderFactory, SessionComponents, WsProviderFactory};
pub use registry::{SessionError, SessionRegistry};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::core::audio::{AudioBusError, AudioFrame, AudioFrameBus};
use crate::core::recognition::{RecognitionStreamManager, RecognitionStreamState};
use crate::core::synthesis::SynthesisStreamManager;
use crate::core::turn::{TurnManager, TurnSignal, TurnState};
use crate::transport::TransportSink;

/// One live call from connect to hangup.
///
/// Owns the audio frame bus, both stream managers, the dialogue context
/// (inside the turn manager) and the spawned per-session tasks. Exactly one
/// `CallSession` exists per call identifier; the registry enforces it.
pub struct CallSession {
    call_id: String,
    created_at: SystemTime,
    started: tokio::time::Instant,
    config: Arc<SessionConfig>,
    bus: Arc<AudioFrameBus>,
    synthesis: Arc<SynthesisStreamManager>,
    signal_tx: mpsc::UnboundedSender<TurnSignal>,
    state_rx: watch::Receiver<TurnState>,
    recognition_state: Arc<parking_lot::RwLock<RecognitionStreamState>>,
    end_reason: Arc<Mutex<Option<String>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    next_seq: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}

impl CallSession {
    /// Wire up and launch a session. No provider network I/O happens here:
    /// the recognition manager connects inside its own task and the
    /// synthesis link is established lazily at first use.
    pub(crate) fn start(
        call_id: String,
        config: Arc<SessionConfig>,
        components: SessionComponents,
        transport: Arc<dyn TransportSink>,
    ) -> Arc<Self> {
        let bus = Arc::new(AudioFrameBus::new(config.audio_bus_capacity));
        let consumer = bus
            .consumer()
            .expect("fresh audio bus always has a consumer");

        let (recognition_manager, recognition_events) = RecognitionStreamManager::new(
            components.recognition,
            consumer,
            config.retry_policy(),
            config.replay_limit,
        );
        let recognition_state = recognition_manager.state_handle();

        let (synthesis_manager, synthesis_events) =
            SynthesisStreamManager::new(components.synthesis, config.cancel_budget());
        let synthesis = Arc::new(synthesis_manager);

        let end_reason = Arc::new(Mutex::new(None));
        let turn_manager = TurnManager::new(
            call_id.clone(),
            config.clone(),
            components.responder,
            synthesis.clone(),
            transport,
            end_reason.clone(),
        );
        let signal_tx = turn_manager.signal_sender();
        let state_rx = turn_manager.subscribe();

        let recognition_task = tokio::spawn(recognition_manager.run());
        let turn_task = tokio::spawn(turn_manager.run(recognition_events, synthesis_events));

        Arc::new(Self {
            call_id,
            created_at: SystemTime::now(),
            started: tokio::time::Instant::now(),
            config,
            bus,
            synthesis,
            signal_tx,
            state_rx,
            recognition_state,
            end_reason,
            tasks: Mutex::new(vec![recognition_task, turn_task]),
            next_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Enqueue one frame of caller audio. [`AudioBusError::Backpressure`] is
    /// surfaced to the transport rather than silently dropped.
    pub fn push_audio(&self, payload: Bytes) -> Result<u64, AudioBusError> {
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        self.bus.push(AudioFrame::inbound(seq, payload))?;
        Ok(seq)
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current turn state; exactly one at any instant.
    pub fn turn_state(&self) -> TurnState {
        *self.state_rx.borrow()
    }

    /// Watch turn state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<TurnState> {
        self.state_rx.clone()
    }

    pub fn recognition_state(&self) -> RecognitionStreamState {
        *self.recognition_state.read()
    }

    /// Error reason recorded when the session ended abnormally.
    pub fn end_reason(&self) -> Option<String> {
        self.end_reason.lock().clone()
    }

    /// Signal a transport-initiated hangup.
    pub fn hangup(&self) {
        let _ = self.signal_tx.send(TurnSignal::Hangup);
    }

    /// Release every owned resource. Idempotent; always runs stream-manager
    /// shutdown even when the providers already disconnected, so no provider
    /// connection can leak.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(call_id = %self.call_id, "session shutting down");

        let _ = self.signal_tx.send(TurnSignal::Hangup);
        self.bus.close();
        self.synthesis.shutdown().await;

        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for mut handle in handles {
            if timeout(Duration::from_secs(2), &mut handle).await.is_err() {
                warn!(call_id = %self.call_id, "session task did not stop in time, aborting");
                handle.abort();
            }
        }
        debug!(call_id = %self.call_id, reason = ?self.end_reason.lock(), "session closed");
    }
}
