//! Recognition stream manager.
//!
//! Owns one provider link per call, feeds it audio frames from the bus in
//! order, and surfaces an ordered sequence of transcript events to the turn
//! manager. Transient provider disconnects are absorbed here through a
//! bounded reconnect with backoff; only an exhausted budget is surfaced, as
//! [`RecognitionEvent::Degraded`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::audio::{AudioBusConsumer, AudioFrame};
use crate::core::retry::RetryPolicy;

use super::base::{RecognitionEvent, RecognitionProvider, TranscriptSegment};

/// Connection state of the recognition stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionStreamState {
    Connecting,
    Streaming,
    Reconnecting,
    Closed,
}

/// Per-call recognition pipeline: audio bus consumer plus provider pump.
pub struct RecognitionStreamManager {
    provider: Box<dyn RecognitionProvider>,
    consumer: AudioBusConsumer,
    event_tx: mpsc::UnboundedSender<RecognitionEvent>,
    retry: RetryPolicy,
    replay_limit: usize,
    state: Arc<RwLock<RecognitionStreamState>>,
}

impl RecognitionStreamManager {
    pub fn new(
        provider: Box<dyn RecognitionProvider>,
        consumer: AudioBusConsumer,
        retry: RetryPolicy,
        replay_limit: usize,
    ) -> (Self, mpsc::UnboundedReceiver<RecognitionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let manager = Self {
            provider,
            consumer,
            event_tx,
            retry,
            replay_limit,
            state: Arc::new(RwLock::new(RecognitionStreamState::Connecting)),
        };
        (manager, event_rx)
    }

    /// Shared handle for observing the stream state.
    pub fn state_handle(&self) -> Arc<RwLock<RecognitionStreamState>> {
        self.state.clone()
    }

    /// Drive the stream until the bus closes, the turn manager goes away, or
    /// the reconnect budget is exhausted.
    pub async fn run(self) {
        let Self {
            mut provider,
            mut consumer,
            event_tx,
            retry,
            replay_limit,
            state,
        } = self;

        // Frames since the last final segment; replayed after a reconnect so
        // a mid-utterance link drop loses no buffered audio.
        let mut replay: VecDeque<AudioFrame> = VecDeque::new();
        let mut last_seq: Option<u64> = None;
        let mut allow_gap = false;

        set_state(&state, RecognitionStreamState::Connecting);
        let mut segments =
            match establish(provider.as_mut(), &retry, &replay, true).await {
                Some(segments) => segments,
                None => {
                    let _ = event_tx.send(RecognitionEvent::Degraded);
                    set_state(&state, RecognitionStreamState::Closed);
                    return;
                }
            };
        set_state(&state, RecognitionStreamState::Streaming);

        'session: loop {
            let disconnected = loop {
                tokio::select! {
                    frame = consumer.pop() => match frame {
                        Ok(frame) => {
                            check_ordering(&mut last_seq, &mut allow_gap, &frame);
                            replay.push_back(frame.clone());
                            while replay.len() > replay_limit {
                                replay.pop_front();
                            }
                            if let Err(e) = provider.send_audio(frame.payload.clone()).await {
                                warn!("recognition send failed: {e}");
                                break true;
                            }
                        }
                        Err(_) => {
                            debug!("audio bus closed, recognition stream winding down");
                            break 'session;
                        }
                    },
                    segment = segments.recv() => match segment {
                        Some(segment) => {
                            if forward_segment(&event_tx, &mut replay, segment).is_err() {
                                break 'session;
                            }
                        }
                        None => {
                            warn!("recognition provider link dropped");
                            break true;
                        }
                    },
                }
            };

            if disconnected {
                set_state(&state, RecognitionStreamState::Reconnecting);
                match establish(provider.as_mut(), &retry, &replay, false).await {
                    Some(fresh) => {
                        segments = fresh;
                        allow_gap = true;
                        set_state(&state, RecognitionStreamState::Streaming);
                    }
                    None => {
                        warn!("recognition reconnect budget exhausted, marking degraded");
                        let _ = event_tx.send(RecognitionEvent::Degraded);
                        break 'session;
                    }
                }
            }
        }

        set_state(&state, RecognitionStreamState::Closed);
        if let Err(e) = provider.disconnect().await {
            debug!("recognition disconnect during teardown: {e}");
        }
    }
}

fn set_state(state: &Arc<RwLock<RecognitionStreamState>>, next: RecognitionStreamState) {
    *state.write() = next;
}

fn check_ordering(last_seq: &mut Option<u64>, allow_gap: &mut bool, frame: &AudioFrame) {
    if let Some(prev) = *last_seq {
        if frame.seq <= prev {
            warn!("audio frame sequence regressed: {} after {}", frame.seq, prev);
        } else if frame.seq != prev + 1 && !*allow_gap {
            warn!("audio frame gap: {} after {}", frame.seq, prev);
        }
    }
    *allow_gap = false;
    *last_seq = Some(frame.seq);
}

fn forward_segment(
    event_tx: &mpsc::UnboundedSender<RecognitionEvent>,
    replay: &mut VecDeque<AudioFrame>,
    segment: TranscriptSegment,
) -> Result<(), ()> {
    let event = if segment.is_final {
        // The utterance up to here is committed provider-side; a later
        // reconnect only needs to replay what follows.
        replay.clear();
        RecognitionEvent::Final(segment)
    } else {
        RecognitionEvent::Partial(segment)
    };
    event_tx.send(event).map_err(|_| ())
}

/// Connect (or reconnect) within the retry budget, replaying buffered frames
/// on success. Returns the fresh segment stream, or `None` once the budget
/// is exhausted.
async fn establish(
    provider: &mut dyn RecognitionProvider,
    retry: &RetryPolicy,
    replay: &VecDeque<AudioFrame>,
    initial: bool,
) -> Option<mpsc::UnboundedReceiver<TranscriptSegment>> {
    for attempt in 1..=retry.max_attempts.max(1) {
        if !(initial && attempt == 1) {
            tokio::time::sleep(retry.backoff(attempt)).await;
        }

        match provider.connect().await {
            Ok(()) => {
                let Some(segments) = provider.segments() else {
                    warn!("recognition provider connected without a segment stream");
                    continue;
                };

                let mut replayed = true;
                for frame in replay {
                    if let Err(e) = provider.send_audio(frame.payload.clone()).await {
                        warn!("replay of buffered audio failed: {e}");
                        replayed = false;
                        break;
                    }
                }
                if !replayed {
                    continue;
                }
                if !replay.is_empty() {
                    info!("replayed {} buffered audio frames after reconnect", replay.len());
                }
                return Some(segments);
            }
            Err(e) => {
                warn!("recognition connect attempt {attempt} failed: {e}");
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    use crate::core::audio::AudioFrameBus;
    use crate::core::recognition::base::RecognitionError;

    use super::*;

    /// Stub provider driven by the test through per-connection segment
    /// senders.
    struct ScriptedProvider {
        connects: Arc<AtomicUsize>,
        failures_before_connect: Arc<AtomicUsize>,
        sent: Arc<Mutex<Vec<Bytes>>>,
        senders: Arc<Mutex<Vec<mpsc::UnboundedSender<TranscriptSegment>>>>,
        pending_rx: Option<mpsc::UnboundedReceiver<TranscriptSegment>>,
        ready: bool,
    }

    impl ScriptedProvider {
        fn new(
            failures_before_connect: usize,
        ) -> (
            Self,
            Arc<AtomicUsize>,
            Arc<Mutex<Vec<Bytes>>>,
            Arc<Mutex<Vec<mpsc::UnboundedSender<TranscriptSegment>>>>,
        ) {
            let connects = Arc::new(AtomicUsize::new(0));
            let sent = Arc::new(Mutex::new(Vec::new()));
            let senders = Arc::new(Mutex::new(Vec::new()));
            let provider = Self {
                connects: connects.clone(),
                failures_before_connect: Arc::new(AtomicUsize::new(failures_before_connect)),
                sent: sent.clone(),
                senders: senders.clone(),
                pending_rx: None,
                ready: false,
            };
            (provider, connects, sent, senders)
        }
    }

    #[async_trait]
    impl RecognitionProvider for ScriptedProvider {
        async fn connect(&mut self) -> Result<(), RecognitionError> {
            if self
                .failures_before_connect
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RecognitionError::ConnectionFailed("scripted".to_string()));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            self.senders.lock().push(tx);
            self.pending_rx = Some(rx);
            self.ready = true;
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), RecognitionError> {
            self.ready = false;
            Ok(())
        }

        fn is_ready(&self) -> bool {
            self.ready
        }

        async fn send_audio(&mut self, audio: Bytes) -> Result<(), RecognitionError> {
            self.sent.lock().push(audio);
            Ok(())
        }

        fn segments(&mut self) -> Option<mpsc::UnboundedReceiver<TranscriptSegment>> {
            self.pending_rx.take()
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met within timeout");
    }

    #[tokio::test]
    async fn frames_are_forwarded_in_order() {
        let bus = AudioFrameBus::new(16);
        let consumer = bus.consumer().unwrap();
        let (provider, _connects, sent, senders) = ScriptedProvider::new(0);
        let (manager, mut events) =
            RecognitionStreamManager::new(Box::new(provider), consumer, fast_retry(), 64);

        let handle = tokio::spawn(manager.run());

        for seq in 0..4u64 {
            bus.push(AudioFrame::inbound(seq, Bytes::from(vec![seq as u8])))
                .unwrap();
        }

        let sent_probe = sent.clone();
        wait_until(move || sent_probe.lock().len() == 4).await;
        let payloads = sent.lock().clone();
        assert_eq!(
            payloads,
            vec![
                Bytes::from(vec![0]),
                Bytes::from(vec![1]),
                Bytes::from(vec![2]),
                Bytes::from(vec![3]),
            ]
        );

        let tx = senders.lock()[0].clone();
        tx.send(TranscriptSegment::final_segment("hello", 0, 500))
            .unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(event, RecognitionEvent::Final(segment) if segment.text == "hello"));

        bus.close();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_replays_buffered_utterance_audio() {
        let bus = AudioFrameBus::new(16);
        let consumer = bus.consumer().unwrap();
        let (provider, connects, sent, senders) = ScriptedProvider::new(0);
        let (manager, mut events) =
            RecognitionStreamManager::new(Box::new(provider), consumer, fast_retry(), 64);

        let handle = tokio::spawn(manager.run());

        for seq in 0..3u64 {
            bus.push(AudioFrame::inbound(seq, Bytes::from(vec![seq as u8])))
                .unwrap();
        }
        let sent_probe = sent.clone();
        wait_until(move || sent_probe.lock().len() == 3).await;

        // Mid-utterance partial, then the link drops.
        let first_tx = senders.lock()[0].clone();
        first_tx
            .send(TranscriptSegment::partial("hel", 0, 300))
            .unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(event, RecognitionEvent::Partial(_)));
        drop(first_tx);
        senders.lock().remove(0);

        // The manager reconnects and replays the three buffered frames.
        let connects_probe = connects.clone();
        wait_until(move || connects_probe.load(Ordering::SeqCst) == 2).await;
        let sent_probe = sent.clone();
        wait_until(move || sent_probe.lock().len() == 6).await;

        // The utterance still completes as one final segment.
        let second_tx = senders.lock()[0].clone();
        second_tx
            .send(TranscriptSegment::final_segment("hello there", 0, 900))
            .unwrap();
        let event = events.recv().await.unwrap();
        assert!(
            matches!(event, RecognitionEvent::Final(segment) if segment.text == "hello there")
        );

        bus.close();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_reconnect_budget_degrades() {
        let bus = AudioFrameBus::new(16);
        let consumer = bus.consumer().unwrap();
        // First connect succeeds; every reconnect attempt fails.
        let (provider, _connects, _sent, senders) = ScriptedProvider::new(0);
        let failures = provider.failures_before_connect.clone();
        let (manager, mut events) =
            RecognitionStreamManager::new(Box::new(provider), consumer, fast_retry(), 64);

        let handle = tokio::spawn(manager.run());

        let senders_probe = senders.clone();
        wait_until(move || !senders_probe.lock().is_empty()).await;
        failures.store(usize::MAX, Ordering::SeqCst);
        senders.lock().clear();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("degraded event within timeout")
            .unwrap();
        assert_eq!(event, RecognitionEvent::Degraded);

        bus.close();
        handle.await.unwrap();
    }
}
