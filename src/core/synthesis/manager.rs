//! Synthesis stream manager.
//!
//! Wraps a synthesis provider into numbered, cancellable episodes. One
//! episode corresponds to one system utterance (a reply, greeting, fallback
//! or farewell). Cancellation is locally authoritative: the episode is
//! terminal the moment `cancel` runs, regardless of whether the provider
//! acknowledges the clear within its budget, so the turn manager can never
//! deadlock behind an unresponsive link.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::base::{ProviderAudio, SynthesisChunk, SynthesisError, SynthesisProvider};

/// Episode-scoped events surfaced to the turn manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisEvent {
    Chunk(SynthesisChunk),
    /// The episode finished normally; all audio was emitted.
    Complete { episode: u64 },
    /// The episode was cancelled; no further chunks for it will be emitted.
    Cancelled { episode: u64 },
    /// The provider failed the episode.
    Failed { episode: u64, message: String },
}

/// Lock-free view of the episode in flight.
#[derive(Debug, Default)]
struct EpisodeState {
    episode: AtomicU64,
    cancelled: AtomicBool,
    finished: AtomicBool,
    next_seq: AtomicU64,
}

impl EpisodeState {
    fn open(&self, episode: u64) {
        self.episode.store(episode, Ordering::Release);
        self.cancelled.store(false, Ordering::Release);
        self.finished.store(false, Ordering::Release);
        self.next_seq.store(0, Ordering::Release);
    }

    fn is_live(&self) -> bool {
        self.episode.load(Ordering::Acquire) != 0
            && !self.cancelled.load(Ordering::Acquire)
            && !self.finished.load(Ordering::Acquire)
    }
}

/// Per-call synthesis pipeline with episode bookkeeping.
pub struct SynthesisStreamManager {
    provider: tokio::sync::Mutex<Box<dyn SynthesisProvider>>,
    event_tx: mpsc::UnboundedSender<SynthesisEvent>,
    episode_counter: AtomicU64,
    current: Arc<EpisodeState>,
    cancel_budget: Duration,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SynthesisStreamManager {
    pub fn new(
        provider: Box<dyn SynthesisProvider>,
        cancel_budget: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SynthesisEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let manager = Self {
            provider: tokio::sync::Mutex::new(provider),
            event_tx,
            episode_counter: AtomicU64::new(0),
            current: Arc::new(EpisodeState::default()),
            cancel_budget,
            pump: Mutex::new(None),
        };
        (manager, event_rx)
    }

    /// Open a new episode and queue its first text.
    pub async fn begin(&self, text: &str) -> Result<u64, SynthesisError> {
        let mut provider = self.provider.lock().await;
        if !provider.is_ready() {
            provider.connect().await?;
        }
        if let Some(audio_rx) = provider.audio() {
            self.spawn_pump(audio_rx);
        }

        let episode = self.episode_counter.fetch_add(1, Ordering::AcqRel) + 1;
        self.current.open(episode);
        provider.speak(text).await?;
        debug!(episode, "synthesis episode opened");
        Ok(episode)
    }

    /// Queue additional text for the episode in flight.
    pub async fn push(&self, text: &str) -> Result<(), SynthesisError> {
        if !self.current.is_live() {
            return Ok(());
        }
        self.provider.lock().await.speak(text).await
    }

    /// Mark the episode's text complete; [`SynthesisEvent::Complete`] follows
    /// once the provider has emitted all audio.
    pub async fn finish(&self) -> Result<(), SynthesisError> {
        if !self.current.is_live() {
            return Ok(());
        }
        self.provider.lock().await.flush().await
    }

    /// Cancel the episode in flight. Reentrant: a finished or already
    /// cancelled episode is a no-op. The local state transition happens
    /// first; clearing the provider is best-effort within the budget.
    pub async fn cancel(&self) {
        let episode = self.current.episode.load(Ordering::Acquire);
        if episode == 0
            || self.current.finished.load(Ordering::Acquire)
            || self.current.cancelled.swap(true, Ordering::AcqRel)
        {
            return;
        }

        let _ = self.event_tx.send(SynthesisEvent::Cancelled { episode });

        let cleared = timeout(self.cancel_budget, async {
            self.provider.lock().await.clear().await
        })
        .await;
        match cleared {
            Ok(Ok(())) => debug!(episode, "synthesis episode cleared"),
            Ok(Err(e)) => warn!(episode, "synthesis clear failed: {e}"),
            Err(_) => warn!(
                episode,
                "synthesis clear exceeded {:?} budget, continuing on local state",
                self.cancel_budget
            ),
        }
    }

    /// Tear down the provider link. Always runs, even when the link already
    /// dropped, so no provider connection can leak past session destroy.
    pub async fn shutdown(&self) {
        self.current.cancelled.store(true, Ordering::Release);
        match timeout(Duration::from_secs(2), async {
            self.provider.lock().await.disconnect().await
        })
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("synthesis disconnect failed: {e}"),
            Err(_) => warn!("synthesis disconnect timed out"),
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }

    fn spawn_pump(&self, mut audio_rx: mpsc::UnboundedReceiver<ProviderAudio>) {
        let event_tx = self.event_tx.clone();
        let current = self.current.clone();
        let handle = tokio::spawn(async move {
            while let Some(audio) = audio_rx.recv().await {
                let episode = current.episode.load(Ordering::Acquire);
                match audio {
                    ProviderAudio::Chunk(payload) => {
                        if !current.is_live() {
                            debug!(episode, "dropping audio chunk for inactive episode");
                            continue;
                        }
                        let seq = current.next_seq.fetch_add(1, Ordering::AcqRel);
                        let chunk = SynthesisChunk {
                            episode,
                            seq,
                            payload,
                        };
                        if event_tx.send(SynthesisEvent::Chunk(chunk)).is_err() {
                            break;
                        }
                    }
                    ProviderAudio::Flushed => {
                        if !current.is_live() {
                            continue;
                        }
                        current.finished.store(true, Ordering::Release);
                        if event_tx
                            .send(SynthesisEvent::Complete { episode })
                            .is_err()
                        {
                            break;
                        }
                    }
                    ProviderAudio::Error(message) => {
                        if !current.is_live() {
                            continue;
                        }
                        current.finished.store(true, Ordering::Release);
                        if event_tx
                            .send(SynthesisEvent::Failed { episode, message })
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            debug!("synthesis audio pump ended");
        });

        if let Some(previous) = self.pump.lock().replace(handle) {
            // The previous pump drains on its own once its channel closes.
            drop(previous);
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;

    type AudioHandle = Arc<Mutex<Option<mpsc::UnboundedSender<ProviderAudio>>>>;

    /// Stub provider; the test emits audio through the shared handle.
    struct StubSynthesis {
        audio_handle: AudioHandle,
        pending_rx: Option<mpsc::UnboundedReceiver<ProviderAudio>>,
        spoken: Arc<Mutex<Vec<String>>>,
        cleared: Arc<AtomicU64>,
        ready: bool,
    }

    impl StubSynthesis {
        fn new() -> (Self, AudioHandle, Arc<Mutex<Vec<String>>>, Arc<AtomicU64>) {
            let audio_handle: AudioHandle = Arc::new(Mutex::new(None));
            let spoken = Arc::new(Mutex::new(Vec::new()));
            let cleared = Arc::new(AtomicU64::new(0));
            let stub = Self {
                audio_handle: audio_handle.clone(),
                pending_rx: None,
                spoken: spoken.clone(),
                cleared: cleared.clone(),
                ready: false,
            };
            (stub, audio_handle, spoken, cleared)
        }
    }

    #[async_trait]
    impl SynthesisProvider for StubSynthesis {
        async fn connect(&mut self) -> Result<(), SynthesisError> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.audio_handle.lock() = Some(tx);
            self.pending_rx = Some(rx);
            self.ready = true;
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), SynthesisError> {
            self.ready = false;
            Ok(())
        }

        fn is_ready(&self) -> bool {
            self.ready
        }

        async fn speak(&mut self, text: &str) -> Result<(), SynthesisError> {
            self.spoken.lock().push(text.to_string());
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), SynthesisError> {
            Ok(())
        }

        async fn clear(&mut self) -> Result<(), SynthesisError> {
            self.cleared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn audio(&mut self) -> Option<mpsc::UnboundedReceiver<ProviderAudio>> {
            self.pending_rx.take()
        }
    }

    fn emit(handle: &AudioHandle, audio: ProviderAudio) {
        handle
            .lock()
            .as_ref()
            .expect("provider connected")
            .send(audio)
            .unwrap();
    }

    #[tokio::test]
    async fn episode_emits_ordered_chunks_then_complete() {
        let (stub, audio, spoken, _cleared) = StubSynthesis::new();
        let (manager, mut events) =
            SynthesisStreamManager::new(Box::new(stub), Duration::from_millis(100));

        let episode = manager.begin("Your order").await.unwrap();
        manager.push(" ships tomorrow.").await.unwrap();
        manager.finish().await.unwrap();
        assert_eq!(
            spoken.lock().clone(),
            vec!["Your order".to_string(), " ships tomorrow.".to_string()]
        );

        emit(&audio, ProviderAudio::Chunk(Bytes::from_static(b"aa")));
        emit(&audio, ProviderAudio::Chunk(Bytes::from_static(b"bb")));
        emit(&audio, ProviderAudio::Flushed);

        for expected_seq in 0..2u64 {
            match events.recv().await.unwrap() {
                SynthesisEvent::Chunk(chunk) => {
                    assert_eq!(chunk.episode, episode);
                    assert_eq!(chunk.seq, expected_seq);
                }
                other => panic!("expected chunk, got {other:?}"),
            }
        }
        assert_eq!(
            events.recv().await.unwrap(),
            SynthesisEvent::Complete { episode }
        );
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_drops_later_chunks() {
        let (stub, audio, _spoken, cleared) = StubSynthesis::new();
        let (manager, mut events) =
            SynthesisStreamManager::new(Box::new(stub), Duration::from_millis(100));

        let episode = manager.begin("long reply").await.unwrap();

        manager.cancel().await;
        manager.cancel().await;
        assert_eq!(cleared.load(Ordering::SeqCst), 1);

        // Audio that straggles in after the cancel is swallowed.
        emit(&audio, ProviderAudio::Chunk(Bytes::from_static(b"late")));
        emit(&audio, ProviderAudio::Flushed);

        assert_eq!(
            events.recv().await.unwrap(),
            SynthesisEvent::Cancelled { episode }
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_after_complete_is_a_no_op() {
        let (stub, audio, _spoken, cleared) = StubSynthesis::new();
        let (manager, mut events) =
            SynthesisStreamManager::new(Box::new(stub), Duration::from_millis(100));

        let episode = manager.begin("short").await.unwrap();
        manager.finish().await.unwrap();
        emit(&audio, ProviderAudio::Flushed);
        assert_eq!(
            events.recv().await.unwrap(),
            SynthesisEvent::Complete { episode }
        );

        manager.cancel().await;
        assert_eq!(cleared.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn provider_error_fails_the_episode() {
        let (stub, audio, _spoken, _cleared) = StubSynthesis::new();
        let (manager, mut events) =
            SynthesisStreamManager::new(Box::new(stub), Duration::from_millis(100));

        let episode = manager.begin("text").await.unwrap();
        emit(&audio, ProviderAudio::Error("voice unavailable".to_string()));

        assert_eq!(
            events.recv().await.unwrap(),
            SynthesisEvent::Failed {
                episode,
                message: "voice unavailable".to_string()
            }
        );
    }
}
