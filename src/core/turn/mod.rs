//! Turn manager: the per-call state machine.
//!
//! All turn-taking decisions live here: when the caller has finished an
//! utterance, when to invoke the response generator, when synthesis may
//! start, and when a caller utterance must interrupt ongoing synthesis
//! (barge-in). The manager is logically single-threaded per session — every
//! transition runs inside one event loop, so no dual-state window is ever
//! observable — and the current state is published through a `watch` channel.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::core::dialogue::{DialogueContext, DialogueTurn};
use crate::core::recognition::base::{RecognitionEvent, TranscriptSegment};
use crate::core::responder::{ResponderError, ResponseChunk, ResponseGenerator, ResponseStream};
use crate::core::synthesis::{SynthesisEvent, SynthesisStreamManager};
use crate::core::utils::{append_text, now_ms};
use crate::transport::TransportSink;

/// Turn-taking state of a call session. Exactly one state holds at any
/// instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// The caller may speak; the system is silent.
    Listening,
    /// The caller finished an utterance; a reply is being generated.
    Pondering,
    /// Synthesized audio is streaming to the caller.
    Speaking,
    /// The caller barged in; synthesis is being cancelled.
    Interrupted,
    /// Terminal.
    Ended,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Listening => "listening",
            TurnState::Pondering => "pondering",
            TurnState::Speaking => "speaking",
            TurnState::Interrupted => "interrupted",
            TurnState::Ended => "ended",
        }
    }
}

/// Signals feeding the event loop besides the provider streams.
#[derive(Debug)]
pub enum TurnSignal {
    Reply {
        generation: u64,
        chunk: ResponseChunk,
    },
    ReplyFailed {
        generation: u64,
        error: ResponderError,
    },
    Hangup,
}

/// What a synthesis episode is speaking; decides what happens on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpisodeKind {
    Greeting,
    Reply,
    Fallback,
    Farewell,
}

pub struct TurnManager {
    call_id: String,
    config: Arc<SessionConfig>,
    responder: Arc<dyn ResponseGenerator>,
    synthesis: Arc<SynthesisStreamManager>,
    transport: Arc<dyn TransportSink>,
    context: DialogueContext,
    end_reason: Arc<Mutex<Option<String>>>,

    state: TurnState,
    state_tx: watch::Sender<TurnState>,
    signal_tx: mpsc::UnboundedSender<TurnSignal>,
    signal_rx: Option<mpsc::UnboundedReceiver<TurnSignal>>,

    /// Invalidates stale reply chunks after barge-in or an extended turn.
    generation: u64,
    reply_pump: Option<tokio::task::JoinHandle<()>>,
    episode: Option<(u64, EpisodeKind)>,
    /// Text of the episode in flight, committed to the context when the
    /// episode completes.
    reply_text: String,

    utterance: String,
    utterance_started_ms: u64,
    utterance_ended_ms: u64,
    /// End-of-utterance silence window after a final segment.
    endpoint_deadline: Option<Instant>,
    /// Hard upper bound on one utterance, even under continuous partials.
    hard_deadline: Option<Instant>,
    /// No caller input at all: say goodbye and hang up.
    idle_deadline: Option<Instant>,
    end_after_episode: bool,
}

impl TurnManager {
    pub fn new(
        call_id: String,
        config: Arc<SessionConfig>,
        responder: Arc<dyn ResponseGenerator>,
        synthesis: Arc<SynthesisStreamManager>,
        transport: Arc<dyn TransportSink>,
        end_reason: Arc<Mutex<Option<String>>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(TurnState::Listening);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let context = DialogueContext::new(config.context_max_turns);
        Self {
            call_id,
            config,
            responder,
            synthesis,
            transport,
            context,
            end_reason,
            state: TurnState::Listening,
            state_tx,
            signal_tx,
            signal_rx: Some(signal_rx),
            generation: 0,
            reply_pump: None,
            episode: None,
            reply_text: String::new(),
            utterance: String::new(),
            utterance_started_ms: 0,
            utterance_ended_ms: 0,
            endpoint_deadline: None,
            hard_deadline: None,
            idle_deadline: None,
            end_after_episode: false,
        }
    }

    /// Observe turn state transitions.
    pub fn subscribe(&self) -> watch::Receiver<TurnState> {
        self.state_tx.subscribe()
    }

    /// Handle for injecting [`TurnSignal::Hangup`] from the session owner.
    pub fn signal_sender(&self) -> mpsc::UnboundedSender<TurnSignal> {
        self.signal_tx.clone()
    }

    /// Drive the state machine until the session ends.
    pub async fn run(
        mut self,
        mut recognition: mpsc::UnboundedReceiver<RecognitionEvent>,
        mut synthesis_events: mpsc::UnboundedReceiver<SynthesisEvent>,
    ) {
        let Some(mut signals) = self.signal_rx.take() else {
            error!(call_id = %self.call_id, "turn manager started twice");
            return;
        };

        if let Some(greeting) = self.config.greeting.clone() {
            self.start_episode(EpisodeKind::Greeting, &greeting).await;
        } else {
            self.idle_deadline = Some(Instant::now() + self.config.idle_timeout());
        }

        let mut recognition_open = true;
        while self.state != TurnState::Ended {
            let deadline = self.next_deadline();
            let sleep_target =
                deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                event = recognition.recv(), if recognition_open => match event {
                    Some(event) => self.on_recognition(event).await,
                    // Channel close without an explicit Degraded event means
                    // the session is already tearing down.
                    None => recognition_open = false,
                },
                event = synthesis_events.recv() => match event {
                    Some(event) => self.on_synthesis(event).await,
                    None => break,
                },
                signal = signals.recv() => match signal {
                    Some(signal) => self.on_signal(signal).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(sleep_target), if deadline.is_some() => {
                    self.on_deadline().await;
                }
            }
        }

        self.abandon_generation();
        self.set_state(TurnState::Ended);
        debug!(call_id = %self.call_id, "turn manager loop ended");
    }

    // ── recognition ────────────────────────────────────────────────────

    async fn on_recognition(&mut self, event: RecognitionEvent) {
        match event {
            RecognitionEvent::Partial(segment) => self.on_partial(segment).await,
            RecognitionEvent::Final(segment) => self.on_final(segment).await,
            RecognitionEvent::Degraded => self.on_degraded().await,
        }
    }

    async fn on_partial(&mut self, segment: TranscriptSegment) {
        if segment.text.trim().is_empty() {
            return;
        }
        match self.state {
            TurnState::Listening => {
                // The caller is still speaking: restart the silence window
                // and push the idle window forward.
                let now = Instant::now();
                if !self.utterance.is_empty() {
                    self.endpoint_deadline = Some(now + self.config.silence_threshold());
                }
                if self.idle_deadline.is_some() {
                    self.idle_deadline = Some(now + self.config.idle_timeout());
                }
            }
            TurnState::Speaking => self.barge_in().await,
            TurnState::Pondering | TurnState::Interrupted | TurnState::Ended => {}
        }
    }

    async fn on_final(&mut self, segment: TranscriptSegment) {
        // Empty finals are endpointing noise from the provider.
        if segment.text.trim().is_empty() {
            return;
        }
        if self.utterance.is_empty() {
            self.utterance_started_ms = segment.start_ms;
        }
        append_text(&mut self.utterance, &segment.text);
        self.utterance_ended_ms = segment.end_ms;

        match self.state {
            TurnState::Listening => {
                let now = Instant::now();
                self.idle_deadline = None;
                self.endpoint_deadline = Some(now + self.config.silence_threshold());
                if self.hard_deadline.is_none() {
                    self.hard_deadline = Some(now + self.config.utterance_hard_timeout());
                }
            }
            TurnState::Speaking => self.barge_in().await,
            TurnState::Pondering => {
                // The caller kept talking: abandon the in-flight reply; the
                // continuation becomes the next turn.
                info!(call_id = %self.call_id, "caller continued during pondering, abandoning reply");
                self.abandon_generation();
                self.enter_listening();
            }
            TurnState::Interrupted | TurnState::Ended => {}
        }
    }

    async fn on_degraded(&mut self) {
        if self.state == TurnState::Ended || self.end_after_episode {
            return;
        }
        error!(call_id = %self.call_id, "recognition degraded beyond recovery, winding down");
        self.record_end_reason("recognition stream degraded");
        self.abandon_generation();
        self.end_after_episode = true;
        if matches!(self.state, TurnState::Speaking | TurnState::Interrupted) {
            self.synthesis.cancel().await;
        }
        let farewell = self.config.farewell_phrase.clone();
        self.start_episode(EpisodeKind::Farewell, &farewell).await;
    }

    /// Barge-in always wins over an in-flight reply: cancellation is signaled
    /// before the new utterance is processed, and the cancelled reply is
    /// never resumed.
    async fn barge_in(&mut self) {
        info!(call_id = %self.call_id, "barge-in, cancelling synthesis");
        self.set_state(TurnState::Interrupted);
        self.abandon_generation();
        self.reply_text.clear();
        self.synthesis.cancel().await;
    }

    // ── synthesis ──────────────────────────────────────────────────────

    async fn on_synthesis(&mut self, event: SynthesisEvent) {
        match event {
            SynthesisEvent::Chunk(chunk) => {
                let current =
                    matches!(self.episode, Some((episode, _)) if episode == chunk.episode);
                if current && self.state == TurnState::Speaking {
                    self.transport.send_audio(&self.call_id, chunk).await;
                } else {
                    debug!(call_id = %self.call_id, "dropping synthesis chunk for stale episode");
                }
            }
            SynthesisEvent::Complete { episode } => {
                let Some((current, kind)) = self.episode else {
                    return;
                };
                if current != episode {
                    return;
                }
                self.episode = None;
                self.commit_system_turn();
                if self.end_after_episode || kind == EpisodeKind::Farewell {
                    info!(call_id = %self.call_id, "final episode complete, hanging up");
                    self.transport.hangup(&self.call_id).await;
                    self.set_state(TurnState::Ended);
                } else {
                    self.enter_listening();
                }
            }
            SynthesisEvent::Cancelled { episode } => {
                if !matches!(self.episode, Some((current, _)) if current == episode) {
                    return;
                }
                self.episode = None;
                self.reply_text.clear();
                if self.state == TurnState::Interrupted {
                    self.enter_listening();
                }
            }
            SynthesisEvent::Failed { episode, message } => {
                if !matches!(self.episode, Some((current, _)) if current == episode) {
                    return;
                }
                error!(call_id = %self.call_id, "synthesis episode failed: {message}");
                self.episode = None;
                self.fail_terminal(format!("synthesis failed: {message}"))
                    .await;
            }
        }
    }

    // ── responder ──────────────────────────────────────────────────────

    async fn on_signal(&mut self, signal: TurnSignal) {
        match signal {
            TurnSignal::Reply { generation, chunk } => {
                if generation == self.generation {
                    self.on_reply_chunk(chunk).await;
                }
            }
            TurnSignal::ReplyFailed { generation, error } => {
                if generation == self.generation {
                    self.on_reply_failed(error).await;
                }
            }
            TurnSignal::Hangup => {
                info!(call_id = %self.call_id, "hangup signal");
                self.record_end_reason("transport hangup");
                self.abandon_generation();
                self.synthesis.cancel().await;
                self.set_state(TurnState::Ended);
            }
        }
    }

    async fn on_reply_chunk(&mut self, chunk: ResponseChunk) {
        if chunk.end_of_call {
            self.end_after_episode = true;
        }
        match self.state {
            TurnState::Pondering => {
                self.reply_text.push_str(&chunk.text);
                if chunk.is_final && self.reply_text.trim().is_empty() {
                    if self.end_after_episode {
                        // Marker-only reply: nothing to speak, just wrap up.
                        self.transport.hangup(&self.call_id).await;
                        self.record_end_reason("model requested end of call");
                        self.set_state(TurnState::Ended);
                    } else {
                        warn!(call_id = %self.call_id, "empty reply, using fallback phrase");
                        self.speak_fallback().await;
                    }
                    return;
                }
                if chunk.text.trim().is_empty() && !chunk.is_final {
                    return;
                }
                match self.synthesis.begin(&chunk.text).await {
                    Ok(episode) => {
                        self.episode = Some((episode, EpisodeKind::Reply));
                        self.clear_deadlines();
                        self.set_state(TurnState::Speaking);
                        if chunk.is_final {
                            if let Err(e) = self.synthesis.finish().await {
                                warn!("failed to flush reply episode: {e}");
                            }
                        }
                    }
                    Err(e) => {
                        error!(call_id = %self.call_id, "could not start reply episode: {e}");
                        self.fail_terminal(format!("synthesis unavailable: {e}"))
                            .await;
                    }
                }
            }
            TurnState::Speaking => {
                if !matches!(self.episode, Some((_, EpisodeKind::Reply))) {
                    return;
                }
                self.reply_text.push_str(&chunk.text);
                if !chunk.text.is_empty() {
                    if let Err(e) = self.synthesis.push(&chunk.text).await {
                        warn!("failed to queue reply text: {e}");
                    }
                }
                if chunk.is_final {
                    if let Err(e) = self.synthesis.finish().await {
                        warn!("failed to flush reply episode: {e}");
                    }
                }
            }
            TurnState::Listening | TurnState::Interrupted | TurnState::Ended => {}
        }
    }

    async fn on_reply_failed(&mut self, error: ResponderError) {
        match self.state {
            TurnState::Pondering => {
                warn!(call_id = %self.call_id, "response generation failed: {error}, speaking fallback");
                self.speak_fallback().await;
            }
            TurnState::Speaking => {
                // The reply died mid-stream; close out what was already
                // queued so the episode still completes.
                warn!(call_id = %self.call_id, "reply stream failed mid-episode: {error}");
                if let Err(e) = self.synthesis.finish().await {
                    warn!("failed to flush partial reply: {e}");
                }
            }
            _ => {}
        }
    }

    // ── deadlines ──────────────────────────────────────────────────────

    fn next_deadline(&self) -> Option<Instant> {
        if self.state != TurnState::Listening {
            return None;
        }
        [
            self.endpoint_deadline,
            self.hard_deadline,
            self.idle_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn on_deadline(&mut self) {
        if self.state != TurnState::Listening {
            return;
        }
        let now = Instant::now();
        let endpoint_due = self.endpoint_deadline.is_some_and(|d| d <= now);
        let hard_due = self.hard_deadline.is_some_and(|d| d <= now);
        let idle_due = self.idle_deadline.is_some_and(|d| d <= now);

        if endpoint_due || hard_due {
            if self.utterance.is_empty() {
                self.endpoint_deadline = None;
                self.hard_deadline = None;
            } else {
                self.commit_utterance().await;
            }
        } else if idle_due {
            self.on_idle_timeout().await;
        }
    }

    /// End-of-utterance: the silence window elapsed with no further speech.
    async fn commit_utterance(&mut self) {
        self.clear_deadlines();
        let utterance = std::mem::take(&mut self.utterance);
        let prior_context = self.context.snapshot();
        self.context.push(DialogueTurn::caller(
            utterance.clone(),
            self.utterance_started_ms,
            self.utterance_ended_ms,
        ));
        self.utterance_started_ms = 0;
        self.utterance_ended_ms = 0;

        self.generation += 1;
        let generation = self.generation;
        info!(call_id = %self.call_id, %utterance, "utterance committed, generating reply");
        self.reply_text.clear();
        self.set_state(TurnState::Pondering);

        match self.responder.generate(prior_context, &utterance).await {
            Ok(stream) => self.spawn_reply_pump(generation, stream),
            Err(e) => {
                warn!(call_id = %self.call_id, "could not start generation: {e}");
                self.speak_fallback().await;
            }
        }
    }

    async fn on_idle_timeout(&mut self) {
        info!(call_id = %self.call_id, "no caller input within idle window, saying goodbye");
        self.record_end_reason("idle timeout");
        self.end_after_episode = true;
        let farewell = self.config.farewell_phrase.clone();
        self.start_episode(EpisodeKind::Farewell, &farewell).await;
    }

    // ── helpers ────────────────────────────────────────────────────────

    fn spawn_reply_pump(&mut self, generation: u64, mut stream: ResponseStream) {
        let signal_tx = self.signal_tx.clone();
        self.reply_pump = Some(tokio::spawn(async move {
            while let Some(item) = stream.recv().await {
                let done = matches!(&item, Ok(chunk) if chunk.is_final) || item.is_err();
                let signal = match item {
                    Ok(chunk) => TurnSignal::Reply { generation, chunk },
                    Err(error) => TurnSignal::ReplyFailed { generation, error },
                };
                if signal_tx.send(signal).is_err() || done {
                    break;
                }
            }
        }));
    }

    /// Invalidate the in-flight generation; dropping the pump drops the lazy
    /// reply stream, which cancels the backend request.
    fn abandon_generation(&mut self) {
        self.generation += 1;
        if let Some(pump) = self.reply_pump.take() {
            pump.abort();
        }
    }

    async fn start_episode(&mut self, kind: EpisodeKind, text: &str) {
        match self.synthesis.begin(text).await {
            Ok(episode) => {
                self.episode = Some((episode, kind));
                self.reply_text = text.to_string();
                self.clear_deadlines();
                self.set_state(TurnState::Speaking);
                if kind != EpisodeKind::Reply {
                    if let Err(e) = self.synthesis.finish().await {
                        warn!("failed to flush synthesis episode: {e}");
                    }
                }
            }
            Err(e) => {
                error!(call_id = %self.call_id, "could not start synthesis episode: {e}");
                self.fail_terminal(format!("synthesis unavailable: {e}")).await;
            }
        }
    }

    async fn speak_fallback(&mut self) {
        let phrase = self.config.fallback_phrase.clone();
        self.start_episode(EpisodeKind::Fallback, &phrase).await;
    }

    fn clear_deadlines(&mut self) {
        self.endpoint_deadline = None;
        self.hard_deadline = None;
        self.idle_deadline = None;
    }

    fn enter_listening(&mut self) {
        self.set_state(TurnState::Listening);
        let now = Instant::now();
        if self.utterance.is_empty() {
            self.endpoint_deadline = None;
            self.hard_deadline = None;
            self.idle_deadline = Some(now + self.config.idle_timeout());
        } else {
            // Speech buffered while speaking or interrupted: give it a fresh
            // silence window.
            self.endpoint_deadline = Some(now + self.config.silence_threshold());
            self.hard_deadline = Some(now + self.config.utterance_hard_timeout());
            self.idle_deadline = None;
        }
    }

    fn commit_system_turn(&mut self) {
        let text = std::mem::take(&mut self.reply_text);
        if text.trim().is_empty() {
            return;
        }
        let now = now_ms();
        self.context.push(DialogueTurn::system(text, now, now));
    }

    async fn fail_terminal(&mut self, reason: String) {
        error!(call_id = %self.call_id, "unrecoverable: {reason}");
        self.record_end_reason(&reason);
        self.abandon_generation();
        self.synthesis.cancel().await;
        self.transport.hangup(&self.call_id).await;
        self.set_state(TurnState::Ended);
    }

    fn record_end_reason(&self, reason: &str) {
        let mut slot = self.end_reason.lock();
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
    }

    fn set_state(&mut self, next: TurnState) {
        if self.state == next {
            return;
        }
        debug!(
            call_id = %self.call_id,
            from = self.state.as_str(),
            to = next.as_str(),
            "turn state transition"
        );
        self.state = next;
        self.state_tx.send_replace(next);
    }
}
