//! Real-time call pipeline
//!
//! Caller audio flows recognition → turn → completion → synthesis → playback.
//! Every stage reports to the owning call session through a bounded mailbox;
//! only the session mutates turn, sequencing and metrics state.

pub mod completion;
pub mod metrics;
pub mod playback;
pub mod recognition;
pub mod synthesis;
pub mod turn;

pub use completion::{
    CallerContext, CompletionEvent, CompletionRequest, CompletionStreamer, ExternalModel,
    FragmentSplitter, LanguageModel, ModelResponse, OpenAiModel, ReplyFragment,
};
pub use metrics::{CallMetrics, MetricsTracker, PhaseTimer, TurnRecord};
pub use playback::PlaybackSequencer;
pub use recognition::{DeepgramRecognizer, RecognitionAdapter, RecognitionEvent, SpeechRecognizer};
pub use synthesis::{
    AudioSubChunk, ElevenLabsSynthesizer, SpeechSynthesizer, Submission, SynthesisEvent,
    SynthesisStreamer,
};
pub use turn::{CompletedTurn, TranscriptEvent, TurnAggregator, TurnOutcome, TurnState};
