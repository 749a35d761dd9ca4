//! Scripted stub providers for driving a full call session in tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use callbridge::core::dialogue::DialogueTurn;
use callbridge::core::recognition::{RecognitionError, RecognitionProvider, TranscriptSegment};
use callbridge::core::responder::{
    ResponderError, ResponseChunk, ResponseGenerator, ResponseStream,
};
use callbridge::core::session::{CallSession, ProviderFactory, SessionComponents, SessionError};
use callbridge::core::synthesis::{
    ProviderAudio, SynthesisChunk, SynthesisError, SynthesisProvider,
};
use callbridge::core::turn::TurnState;
use callbridge::transport::TransportSink;

pub type SegmentHandle = Arc<Mutex<Option<mpsc::UnboundedSender<TranscriptSegment>>>>;
pub type AudioHandle = Arc<Mutex<Option<mpsc::UnboundedSender<ProviderAudio>>>>;

// ── recognition ────────────────────────────────────────────────────────

/// Recognition provider driven by the test through a shared segment sender.
pub struct StubRecognition {
    handle: SegmentHandle,
    pending_rx: Option<mpsc::UnboundedReceiver<TranscriptSegment>>,
    ready: bool,
}

impl StubRecognition {
    pub fn new() -> (Self, SegmentHandle) {
        let handle: SegmentHandle = Arc::new(Mutex::new(None));
        let stub = Self {
            handle: handle.clone(),
            pending_rx: None,
            ready: false,
        };
        (stub, handle)
    }
}

#[async_trait]
impl RecognitionProvider for StubRecognition {
    async fn connect(&mut self) -> Result<(), RecognitionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.handle.lock() = Some(tx);
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

    async fn send_audio(&mut self, _audio: Bytes) -> Result<(), RecognitionError> {
        Ok(())
    }

    fn segments(&mut self) -> Option<mpsc::UnboundedReceiver<TranscriptSegment>> {
        self.pending_rx.take()
    }
}

pub fn send_partial(handle: &SegmentHandle, text: &str, start_ms: u64, end_ms: u64) {
    handle
        .lock()
        .as_ref()
        .expect("recognition connected")
        .send(TranscriptSegment::partial(text, start_ms, end_ms))
        .unwrap();
}

pub fn send_final(handle: &SegmentHandle, text: &str, start_ms: u64, end_ms: u64) {
    handle
        .lock()
        .as_ref()
        .expect("recognition connected")
        .send(TranscriptSegment::final_segment(text, start_ms, end_ms))
        .unwrap();
}

// ── synthesis ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthMode {
    /// `flush` synthesizes every queued text immediately and completes.
    AutoOnFlush,
    /// The test emits audio through the shared handle.
    Manual,
}

pub struct StubSynthesis {
    mode: SynthMode,
    chunks_per_text: usize,
    queued: Vec<String>,
    audio_handle: AudioHandle,
    pending_rx: Option<mpsc::UnboundedReceiver<ProviderAudio>>,
    spoken: Arc<Mutex<Vec<String>>>,
    cleared: Arc<AtomicUsize>,
    ready: bool,
}

pub struct SynthProbe {
    pub audio: AudioHandle,
    pub spoken: Arc<Mutex<Vec<String>>>,
    pub cleared: Arc<AtomicUsize>,
}

impl StubSynthesis {
    pub fn new(mode: SynthMode, chunks_per_text: usize) -> (Self, SynthProbe) {
        let audio_handle: AudioHandle = Arc::new(Mutex::new(None));
        let spoken = Arc::new(Mutex::new(Vec::new()));
        let cleared = Arc::new(AtomicUsize::new(0));
        let probe = SynthProbe {
            audio: audio_handle.clone(),
            spoken: spoken.clone(),
            cleared: cleared.clone(),
        };
        let stub = Self {
            mode,
            chunks_per_text,
            queued: Vec::new(),
            audio_handle,
            pending_rx: None,
            spoken,
            cleared,
            ready: false,
        };
        (stub, probe)
    }

    fn emit(&self, audio: ProviderAudio) {
        if let Some(tx) = self.audio_handle.lock().as_ref() {
            let _ = tx.send(audio);
        }
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
        self.queued.push(text.to_string());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SynthesisError> {
        if self.mode == SynthMode::AutoOnFlush {
            for text in self.queued.drain(..).collect::<Vec<_>>() {
                for _ in 0..self.chunks_per_text {
                    self.emit(ProviderAudio::Chunk(Bytes::from(text.clone())));
                }
            }
            self.emit(ProviderAudio::Flushed);
        }
        Ok(())
    }

    async fn clear(&mut self) -> Result<(), SynthesisError> {
        self.cleared.fetch_add(1, Ordering::SeqCst);
        self.queued.clear();
        if self.mode == SynthMode::Manual {
            // Simulated provider round-trip; keeps the interrupted window
            // observable to state watchers.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    fn audio(&mut self) -> Option<mpsc::UnboundedReceiver<ProviderAudio>> {
        self.pending_rx.take()
    }
}

pub fn emit_audio(handle: &AudioHandle, payload: &str) {
    handle
        .lock()
        .as_ref()
        .expect("synthesis connected")
        .send(ProviderAudio::Chunk(Bytes::from(payload.to_string())))
        .unwrap();
}

pub fn emit_flushed(handle: &AudioHandle) {
    handle
        .lock()
        .as_ref()
        .expect("synthesis connected")
        .send(ProviderAudio::Flushed)
        .unwrap();
}

// ── responder ──────────────────────────────────────────────────────────

pub enum ReplyScript {
    /// Stream the chunks after an initial delay; the last one is terminal.
    Stream {
        delay_ms: u64,
        chunks: Vec<ResponseChunk>,
    },
    Fail(ResponderError),
}

pub fn reply(delay_ms: u64, text: &str) -> ReplyScript {
    ReplyScript::Stream {
        delay_ms,
        chunks: vec![ResponseChunk {
            text: text.to_string(),
            is_final: true,
            end_of_call: false,
        }],
    }
}

pub fn reply_with_end(delay_ms: u64, text: &str) -> ReplyScript {
    ReplyScript::Stream {
        delay_ms,
        chunks: vec![ResponseChunk {
            text: text.to_string(),
            is_final: true,
            end_of_call: true,
        }],
    }
}

pub struct ScriptedResponder {
    scripts: Mutex<VecDeque<ReplyScript>>,
    pub utterances: Arc<Mutex<Vec<String>>>,
    pub contexts: Arc<Mutex<Vec<Vec<DialogueTurn>>>>,
}

impl ScriptedResponder {
    pub fn new(scripts: Vec<ReplyScript>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            utterances: Arc::new(Mutex::new(Vec::new())),
            contexts: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

#[async_trait]
impl ResponseGenerator for ScriptedResponder {
    async fn generate(
        &self,
        context: Vec<DialogueTurn>,
        utterance: &str,
    ) -> Result<ResponseStream, ResponderError> {
        self.utterances.lock().push(utterance.to_string());
        self.contexts.lock().push(context);

        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or(ReplyScript::Fail(ResponderError::ProviderError(
                "no script left".to_string(),
            )));

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            match script {
                ReplyScript::Stream { delay_ms, chunks } => {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    for chunk in chunks {
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                }
                ReplyScript::Fail(error) => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let _ = tx.send(Err(error)).await;
                }
            }
        });
        Ok(rx)
    }
}

// ── transport ──────────────────────────────────────────────────────────

pub struct RecordingTransport {
    pub audio: Arc<Mutex<Vec<SynthesisChunk>>>,
    pub hangups: Arc<AtomicUsize>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            audio: Arc::new(Mutex::new(Vec::new())),
            hangups: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn audio_count(&self) -> usize {
        self.audio.lock().len()
    }

    pub fn audio_texts(&self) -> Vec<String> {
        self.audio
            .lock()
            .iter()
            .map(|chunk| String::from_utf8_lossy(&chunk.payload).into_owned())
            .collect()
    }
}

#[async_trait]
impl TransportSink for RecordingTransport {
    async fn send_audio(&self, _call_id: &str, chunk: SynthesisChunk) {
        self.audio.lock().push(chunk);
    }

    async fn hangup(&self, _call_id: &str) {
        self.hangups.fetch_add(1, Ordering::SeqCst);
    }
}

// ── factory ────────────────────────────────────────────────────────────

/// Hands out one pre-built component set per `create` call.
pub struct TestFactory {
    components: Mutex<VecDeque<SessionComponents>>,
}

impl TestFactory {
    pub fn new(components: SessionComponents) -> Arc<Self> {
        Arc::new(Self {
            components: Mutex::new(VecDeque::from([components])),
        })
    }
}

impl ProviderFactory for TestFactory {
    fn components(&self) -> Result<SessionComponents, SessionError> {
        self.components
            .lock()
            .pop_front()
            .ok_or_else(|| SessionError::Startup("test factory exhausted".to_string()))
    }
}

// ── helpers ────────────────────────────────────────────────────────────

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within timeout");
}

pub async fn wait_for_state(session: &Arc<CallSession>, state: TurnState) {
    let mut rx = session.state_receiver();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("session never reached {state:?}"))
        .expect("state channel closed");
}

/// Record every observable turn state transition.
pub fn record_states(session: &Arc<CallSession>) -> Arc<Mutex<Vec<TurnState>>> {
    let mut rx = session.state_receiver();
    let log = Arc::new(Mutex::new(vec![*rx.borrow()]));
    let writer = log.clone();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            writer.lock().push(*rx.borrow_and_update());
        }
    });
    log
}

pub async fn wait_for_recognition(handle: &SegmentHandle) {
    let probe = handle.clone();
    wait_until(move || probe.lock().is_some()).await;
}
