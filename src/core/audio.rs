//! Per-call audio frame bus.
//!
//! A bounded FIFO that decouples the transport task (producer) from the
//! recognition stream consumer. `push` never blocks: when the bus is full the
//! caller gets [`AudioBusError::Backpressure`] and the transport applies its
//! own flow control. `pop` suspends until a frame arrives or the session is
//! closing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::utils::now_ms;

/// Direction of an audio frame relative to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioDirection {
    /// Caller audio arriving from the transport.
    Inbound,
    /// Synthesized audio on its way back to the transport.
    Outbound,
}

/// One chunk of call audio with a per-call monotonic sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub seq: u64,
    pub payload: Bytes,
    pub direction: AudioDirection,
    pub timestamp_ms: u64,
}

impl AudioFrame {
    pub fn inbound(seq: u64, payload: Bytes) -> Self {
        Self {
            seq,
            payload,
            direction: AudioDirection::Inbound,
            timestamp_ms: now_ms(),
        }
    }

    pub fn outbound(seq: u64, payload: Bytes) -> Self {
        Self {
            seq,
            payload,
            direction: AudioDirection::Outbound,
            timestamp_ms: now_ms(),
        }
    }
}

/// Error types for audio bus operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AudioBusError {
    /// The bounded capacity is exhausted; the frame was not enqueued.
    #[error("audio bus is full")]
    Backpressure,
    /// The bus has been closed as part of session teardown.
    #[error("audio bus is closed")]
    Closed,
}

/// Bounded single-producer / single-consumer frame queue for one call.
///
/// Capacity is expressed in frames; at the usual 20 ms frame cadence the
/// default capacity covers a few seconds of audio.
pub struct AudioFrameBus {
    tx: Mutex<Option<mpsc::Sender<AudioFrame>>>,
    rx: Mutex<Option<mpsc::Receiver<AudioFrame>>>,
    closed: Arc<AtomicBool>,
    capacity: usize,
}

impl AudioFrameBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            closed: Arc::new(AtomicBool::new(false)),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue a frame without blocking.
    pub fn push(&self, frame: AudioFrame) -> Result<(), AudioBusError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(AudioBusError::Closed)?;
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(AudioBusError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(AudioBusError::Closed),
        }
    }

    /// Take the consumer half. The bus is single-consumer; subsequent calls
    /// return `None`.
    pub fn consumer(&self) -> Option<AudioBusConsumer> {
        self.rx.lock().take().map(|rx| AudioBusConsumer {
            rx,
            closed: self.closed.clone(),
        })
    }

    /// Close the bus. Pending and future `push`/`pop` calls fail with
    /// [`AudioBusError::Closed`]; a consumer blocked in `pop` wakes up.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Consumer half of an [`AudioFrameBus`].
pub struct AudioBusConsumer {
    rx: mpsc::Receiver<AudioFrame>,
    closed: Arc<AtomicBool>,
}

impl AudioBusConsumer {
    /// Wait for the next frame. Fails with [`AudioBusError::Closed`] once the
    /// session is closing; frames still queued at close time are dropped.
    pub async fn pop(&mut self) -> Result<AudioFrame, AudioBusError> {
        match self.rx.recv().await {
            Some(frame) if !self.closed.load(Ordering::Acquire) => Ok(frame),
            _ => Err(AudioBusError::Closed),
        }
    }
}
