//! Turn detection over incremental transcripts

/// Normalized transcript event from the recognizer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub text: String,
    /// Text for this span will not change
    pub is_final: bool,
    /// Recognizer detected the end of the utterance
    pub is_speech_final: bool,
    /// Natural pause with no further final text
    pub is_utterance_end: bool,
}

impl TranscriptEvent {
    /// Interim hypothesis that may still change
    #[must_use]
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Stable text for a span of speech
    #[must_use]
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            ..Self::default()
        }
    }

    /// Stable text that also closes the utterance
    #[must_use]
    pub fn speech_final(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            is_speech_final: true,
            ..Self::default()
        }
    }

    /// End-of-utterance signal, carries no text
    #[must_use]
    pub fn utterance_end() -> Self {
        Self {
            is_utterance_end: true,
            ..Self::default()
        }
    }
}

/// Aggregator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Accumulating,
}

/// Utterance finalized into a turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTurn {
    pub interaction_index: u64,
    pub text: String,
}

/// What one transcript event changed
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Caller started a new utterance
    pub utterance_started: bool,
    /// Caller is talking over playback
    pub barge_in: bool,
    pub completed: Option<CompletedTurn>,
}

/// Accumulates transcript fragments and decides when a turn is complete
#[derive(Debug)]
pub struct TurnAggregator {
    state: TurnState,
    buffer: String,
    next_index: u64,
    barge_in_min_chars: usize,
}

impl TurnAggregator {
    /// Create an aggregator whose first turn gets `first_index`
    #[must_use]
    pub const fn new(first_index: u64, barge_in_min_chars: usize) -> Self {
        Self {
            state: TurnState::Idle,
            buffer: String::new(),
            next_index: first_index,
            barge_in_min_chars,
        }
    }

    #[must_use]
    pub const fn state(&self) -> TurnState {
        self.state
    }

    /// Text accumulated for the utterance in progress
    #[must_use]
    pub fn pending_text(&self) -> &str {
        self.buffer.trim()
    }

    /// Index the next completed turn will receive
    #[must_use]
    pub const fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Feed one transcript event
    ///
    /// `speaking` is whether reply audio is currently playing to the caller.
    pub fn observe(&mut self, event: &TranscriptEvent, speaking: bool) -> TurnOutcome {
        let mut outcome = TurnOutcome::default();

        if event.is_utterance_end {
            if self.buffer.trim().is_empty() {
                self.state = TurnState::Idle;
            } else {
                outcome.completed = Some(self.complete());
            }
            return outcome;
        }

        let text = event.text.trim();
        if text.is_empty() {
            if event.is_speech_final && !self.buffer.trim().is_empty() {
                outcome.completed = Some(self.complete());
            }
            return outcome;
        }

        if self.state == TurnState::Idle {
            self.state = TurnState::Accumulating;
            outcome.utterance_started = true;
        }

        if speaking && text.chars().count() > self.barge_in_min_chars {
            outcome.barge_in = true;
        }

        if event.is_final {
            if !self.buffer.is_empty() {
                self.buffer.push(' ');
            }
            self.buffer.push_str(text);
        }

        if event.is_speech_final && !self.buffer.trim().is_empty() {
            outcome.completed = Some(self.complete());
        }

        outcome
    }

    fn complete(&mut self) -> CompletedTurn {
        let text = self.buffer.trim().to_string();
        self.buffer.clear();
        self.state = TurnState::Idle;

        let interaction_index = self.next_index;
        self.next_index += 1;

        tracing::debug!(interaction = interaction_index, text = %text, "turn complete");
        CompletedTurn {
            interaction_index,
            text,
        }
    }
}
