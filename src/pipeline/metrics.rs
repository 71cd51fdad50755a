//! Per-turn latency bookkeeping
//!
//! A turn is timed from the moment the caller starts speaking (or the call
//! starts, for the welcome turn) until its final audio is handed to the bridge.
//! Phase times are measured independently and may overlap, so the round trip
//! is its own wall-clock measurement rather than a sum.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::time::Instant;

/// Start/elapsed/reset stopwatch for one pipeline phase
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    started: Option<Instant>,
}

impl PhaseTimer {
    /// A timer already running from now
    #[must_use]
    pub fn started() -> Self {
        Self {
            started: Some(Instant::now()),
        }
    }

    /// Start (or restart) the timer
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Stop the timer without reporting
    pub fn reset(&mut self) {
        self.started = None;
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Milliseconds since start, zero when the timer is not running
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        self.started.map_or(0, |s| {
            u64::try_from(s.elapsed().as_millis()).unwrap_or(u64::MAX)
        })
    }
}

/// Latency breakdown for one completed turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRecord {
    pub interaction_index: u64,
    pub input_text: String,
    pub transcription_time_ms: u64,
    pub gpt_time_ms: u64,
    pub tts_time_ms: u64,
    pub round_trip_time_ms: u64,
    /// Playback was cut short by a barge-in
    pub interrupted: bool,
}

/// A turn whose reply is still being generated or played
#[derive(Debug)]
struct InFlightTurn {
    input_text: String,
    transcription_time_ms: u64,
    gpt_time_ms: Option<u64>,
    round_trip: PhaseTimer,
    completion: PhaseTimer,
    synthesis: PhaseTimer,
}

impl InFlightTurn {
    fn finish(self, interaction_index: u64, interrupted: bool) -> TurnRecord {
        TurnRecord {
            interaction_index,
            input_text: self.input_text,
            transcription_time_ms: self.transcription_time_ms,
            gpt_time_ms: self.gpt_time_ms.unwrap_or_else(|| self.completion.elapsed_ms()),
            tts_time_ms: self.synthesis.elapsed_ms(),
            round_trip_time_ms: self.round_trip.elapsed_ms(),
            interrupted,
        }
    }
}

/// Owns the per-call phase timers and the turn history
#[derive(Debug)]
pub struct MetricsTracker {
    call: PhaseTimer,
    transcription: PhaseTimer,
    in_flight: BTreeMap<u64, InFlightTurn>,
    history: Vec<TurnRecord>,
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsTracker {
    /// Create a tracker; the call clock starts now
    #[must_use]
    pub fn new() -> Self {
        Self {
            call: PhaseTimer::started(),
            transcription: PhaseTimer::default(),
            in_flight: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    /// Caller started a new utterance
    pub fn transcription_started(&mut self) {
        self.transcription.start();
    }

    /// An utterance became a turn and was handed to the language model
    pub fn turn_started(&mut self, interaction: u64, input_text: &str) {
        let round_trip = if self.transcription.is_running() {
            self.transcription
        } else {
            PhaseTimer::started()
        };
        let transcription_time_ms = self.transcription.elapsed_ms();
        self.transcription.reset();

        tracing::info!(
            phase = "transcription",
            interaction,
            elapsed_ms = transcription_time_ms,
            "turn detected"
        );

        self.in_flight.insert(
            interaction,
            InFlightTurn {
                input_text: input_text.to_string(),
                transcription_time_ms,
                gpt_time_ms: None,
                round_trip,
                completion: PhaseTimer::started(),
                synthesis: PhaseTimer::default(),
            },
        );
    }

    /// The welcome turn, timed from the start of the call
    pub fn welcome_started(&mut self, interaction: u64) {
        self.in_flight.insert(
            interaction,
            InFlightTurn {
                input_text: "welcome".to_string(),
                transcription_time_ms: 0,
                gpt_time_ms: None,
                round_trip: self.call,
                completion: PhaseTimer::started(),
                synthesis: PhaseTimer::default(),
            },
        );
    }

    /// First reply fragment for a turn arrived from the language model
    pub fn first_fragment(&mut self, interaction: u64) {
        let Some(turn) = self.in_flight.get_mut(&interaction) else {
            return;
        };
        if turn.gpt_time_ms.is_some() {
            return;
        }

        let elapsed_ms = turn.completion.elapsed_ms();
        turn.gpt_time_ms = Some(elapsed_ms);
        turn.synthesis.start();
        tracing::info!(phase = "completion", interaction, elapsed_ms, "first reply fragment");
    }

    /// The last audio of a turn was delivered to the bridge
    pub fn turn_delivered(&mut self, interaction: u64) -> Option<&TurnRecord> {
        self.finalize(interaction, false)
    }

    /// A barge-in cut the turn's playback short
    pub fn turn_interrupted(&mut self, interaction: u64) -> Option<&TurnRecord> {
        self.finalize(interaction, true)
    }

    fn finalize(&mut self, interaction: u64, interrupted: bool) -> Option<&TurnRecord> {
        let turn = self.in_flight.remove(&interaction)?;
        let record = turn.finish(interaction, interrupted);

        tracing::info!(
            phase = "synthesis",
            interaction,
            elapsed_ms = record.tts_time_ms,
            round_trip_ms = record.round_trip_time_ms,
            interrupted,
            "turn finished"
        );

        self.history.push(record);
        self.history.last()
    }

    /// Completed turns in the order they finished
    #[must_use]
    pub fn history(&self) -> &[TurnRecord] {
        &self.history
    }

    /// Number of turns still being generated or played
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Call duration so far in milliseconds
    #[must_use]
    pub fn call_elapsed_ms(&self) -> u64 {
        self.call.elapsed_ms()
    }
}

/// Per-call averages reported at teardown
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallMetrics {
    pub turns: usize,
    pub avg_transcription_ms: f64,
    pub avg_gpt_ms: f64,
    pub avg_tts_ms: f64,
    pub avg_round_trip_ms: f64,
}

impl CallMetrics {
    /// Average the phase times of a turn history
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_turns(turns: &[TurnRecord]) -> Self {
        if turns.is_empty() {
            return Self::default();
        }

        let n = turns.len() as f64;
        let mean = |f: fn(&TurnRecord) -> u64| turns.iter().map(|t| f(t) as f64).sum::<f64>() / n;

        Self {
            turns: turns.len(),
            avg_transcription_ms: mean(|t| t.transcription_time_ms),
            avg_gpt_ms: mean(|t| t.gpt_time_ms),
            avg_tts_ms: mean(|t| t.tts_time_ms),
            avg_round_trip_ms: mean(|t| t.round_trip_time_ms),
        }
    }
}
