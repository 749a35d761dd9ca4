//! Bounded per-call dialogue context.
//!
//! The context is an ordered, append-only sequence of finalized turns with a
//! maximum retained length. Nothing survives the session: there is no
//! cross-call memory.

use std::collections::VecDeque;

use serde::Serialize;

/// Who produced a dialogue turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Caller,
    System,
}

/// One complete utterance attributed to the caller or the system.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DialogueTurn {
    pub speaker: Speaker,
    pub text: String,
    pub started_ms: u64,
    pub ended_ms: u64,
}

impl DialogueTurn {
    pub fn caller(text: impl Into<String>, started_ms: u64, ended_ms: u64) -> Self {
        Self {
            speaker: Speaker::Caller,
            text: text.into(),
            started_ms,
            ended_ms,
        }
    }

    pub fn system(text: impl Into<String>, started_ms: u64, ended_ms: u64) -> Self {
        Self {
            speaker: Speaker::System,
            text: text.into(),
            started_ms,
            ended_ms,
        }
    }
}

/// Ordered dialogue history with FIFO eviction past the configured cap.
#[derive(Debug)]
pub struct DialogueContext {
    turns: VecDeque<DialogueTurn>,
    max_turns: usize,
}

impl DialogueContext {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(max_turns.min(64)),
            max_turns,
        }
    }

    /// Append a finalized turn, evicting the oldest entry when the cap is
    /// reached.
    pub fn push(&mut self, turn: DialogueTurn) {
        if self.max_turns == 0 {
            return;
        }
        while self.turns.len() >= self.max_turns {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    /// Ordered copy of the retained turns, oldest first.
    pub fn snapshot(&self) -> Vec<DialogueTurn> {
        self.turns.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
