//! Switchboard - real-time phone conversation gateway
//!
//! This library drives a live phone conversation over a telephony media stream:
//! - Streaming speech recognition of caller audio
//! - Turn detection and barge-in over incremental transcripts
//! - Language model replies split into speakable fragments
//! - Fragment synthesis re-sequenced into strict playback order
//! - Per-turn latency metrics
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Telephony media bridge                  │
//! │      start  │  media  │  mark  │  stop  │  clear     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                Call session actor                    │
//! │  Recognition → Turn → Completion → Synthesis → Play │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │               External collaborators                 │
//! │   Deepgram  │  LLM  │  ElevenLabs                    │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod telephony;

pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::{
    CallMetrics, CompletionStreamer, FragmentSplitter, LanguageModel, MetricsTracker,
    PhaseTimer, PlaybackSequencer, RecognitionAdapter, ReplyFragment, SpeechSynthesizer,
    SynthesisStreamer, TranscriptEvent, TurnAggregator, TurnRecord,
};
pub use session::{CallSession, SessionRegistry, SessionSnapshot};
pub use telephony::{BridgeEvent, OutboundEvent};
