//! Per-call session actor
//!
//! One [`CallSession`] runs for every media stream. It is the only owner of
//! the turn aggregator, playback sequencer and metrics tracker; recognition,
//! completion and synthesis tasks report back through bounded mailboxes and
//! the session applies their events one at a time.

pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

pub use registry::{SessionRegistry, SessionSnapshot};

use crate::config::Config;
use crate::pipeline::completion::language_model;
use crate::pipeline::{
    CallMetrics, CallerContext, CompletedTurn, CompletionEvent, CompletionRequest,
    CompletionStreamer, DeepgramRecognizer, ElevenLabsSynthesizer, LanguageModel,
    MetricsTracker, PlaybackSequencer, RecognitionAdapter, RecognitionEvent, ReplyFragment,
    SpeechRecognizer, SpeechSynthesizer, Submission, SynthesisEvent, SynthesisStreamer,
    TranscriptEvent, TurnAggregator,
};
use crate::telephony::{BridgeEvent, OutboundEvent, StartMeta};
use crate::Result;

/// How often a session checks playback liveness and republishes its snapshot
const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Prompt sent to the language model for the welcome turn
const WELCOME_PROMPT: &str = " ";

/// Provider clients shared by every call
#[derive(Clone)]
pub struct CallServices {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub model: Arc<dyn LanguageModel>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

impl CallServices {
    /// Build the provider clients named by the configuration
    ///
    /// # Errors
    ///
    /// Returns error if a provider is missing its credentials
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("switchboard/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            recognizer: Arc::new(DeepgramRecognizer::new(&config.recognition)?),
            model: language_model(&config.completion, client.clone())?,
            synthesizer: Arc::new(ElevenLabsSynthesizer::new(client, &config.synthesis)?),
        })
    }
}

/// Receiving ends of a session's mailboxes
pub struct SessionInbox {
    bridge: mpsc::Receiver<BridgeEvent>,
    recognition: mpsc::Receiver<RecognitionEvent>,
    completion: mpsc::Receiver<CompletionEvent>,
    synthesis: mpsc::Receiver<SynthesisEvent>,
}

/// State of one phone call
pub struct CallSession {
    call_id: String,
    stream_id: String,
    started_at: DateTime<Utc>,
    context: Arc<CallerContext>,
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    recognition: RecognitionAdapter,
    aggregator: TurnAggregator,
    sequencer: PlaybackSequencer,
    tracker: MetricsTracker,
    completion: CompletionStreamer,
    synthesis: SynthesisStreamer,
    completion_tx: mpsc::Sender<CompletionEvent>,
    synthesis_tx: mpsc::Sender<SynthesisEvent>,
    /// The caller talked over the last reply; the next turn continues from it
    interrupted: bool,
}

impl CallSession {
    /// Set up a session for a stream that just sent its start event
    ///
    /// Opens the recognition stream and queues the announcement and welcome
    /// turn. A recognizer that cannot be reached leaves the call muted rather
    /// than failing it.
    pub async fn start(
        start: StartMeta,
        bridge: mpsc::Receiver<BridgeEvent>,
        outbound: mpsc::Sender<OutboundEvent>,
        services: CallServices,
        config: Arc<Config>,
        registry: Arc<SessionRegistry>,
    ) -> (Self, SessionInbox) {
        let capacity = config.playback.mailbox_capacity.max(1);
        let (recognition_tx, recognition_rx) = mpsc::channel(capacity);
        let (completion_tx, completion_rx) = mpsc::channel(capacity);
        let (synthesis_tx, synthesis_rx) = mpsc::channel(capacity);

        let call_id = start.call_sid.clone();

        let recognition = match services.recognizer.open(recognition_tx).await {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::error!(call_id = %call_id, error = %e, "recognition unavailable, call continues without input");
                RecognitionAdapter::disconnected()
            }
        };

        let greet = config.call.greet;
        let first_interaction = if greet { 0 } else { 1 };
        let sequencer = PlaybackSequencer::new(
            start.stream_sid.clone(),
            outbound,
            first_interaction,
            &config.playback,
        );

        let context = Arc::new(CallerContext {
            session_id: call_id.clone(),
            details: start.custom_parameters,
        });

        let mut session = Self {
            call_id,
            stream_id: start.stream_sid,
            started_at: Utc::now(),
            context,
            aggregator: TurnAggregator::new(1, config.playback.barge_in_min_chars),
            sequencer,
            tracker: MetricsTracker::new(),
            completion: CompletionStreamer::new(Arc::clone(&services.model), &config.completion),
            synthesis: SynthesisStreamer::new(Arc::clone(&services.synthesizer), &config.synthesis),
            completion_tx,
            synthesis_tx,
            interrupted: false,
            recognition,
            config,
            registry,
        };

        tracing::info!(
            call_id = %session.call_id,
            stream_id = %session.stream_id,
            caller = %describe_caller(&session.context.details),
            "call started"
        );

        session.completion.begin_call(&session.call_id);
        if let Some(text) = session.config.call.announcement.clone() {
            session.announce(text).await;
        }
        if greet {
            session.tracker.welcome_started(0);
            session.request_reply(0, WELCOME_PROMPT.to_string());
        }
        session.publish();

        let inbox = SessionInbox {
            bridge,
            recognition: recognition_rx,
            completion: completion_rx,
            synthesis: synthesis_rx,
        };
        (session, inbox)
    }

    #[must_use]
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Process events until the bridge stops or disconnects
    pub async fn run(mut self, mut inbox: SessionInbox) -> CallMetrics {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = inbox.bridge.recv() => {
                    let Some(event) = event else {
                        tracing::info!(call_id = %self.call_id, "bridge disconnected");
                        break;
                    };
                    if !self.on_bridge(event) {
                        break;
                    }
                }
                Some(event) = inbox.recognition.recv() => self.on_recognition(event).await,
                Some(event) = inbox.completion.recv() => self.on_completion(event).await,
                Some(event) = inbox.synthesis.recv() => self.on_synthesis(event).await,
                _ = tick.tick() => {
                    self.sequencer.check_liveness();
                    self.publish();
                }
            }
        }

        self.teardown()
    }

    /// Returns false once the bridge signals the end of the stream
    fn on_bridge(&mut self, event: BridgeEvent) -> bool {
        match event {
            BridgeEvent::Media { media } => self.recognition.send(&media.payload),
            BridgeEvent::Mark { mark } => self.sequencer.mark_acked(&mark.name),
            BridgeEvent::Stop => {
                tracing::info!(call_id = %self.call_id, "bridge stopped stream");
                return false;
            }
            BridgeEvent::Start { .. } => {
                tracing::warn!(call_id = %self.call_id, "ignoring repeated start event");
            }
            BridgeEvent::Connected => {}
        }
        true
    }

    async fn on_recognition(&mut self, event: RecognitionEvent) {
        match event {
            RecognitionEvent::Transcript(transcript) => self.on_transcript(&transcript).await,
            RecognitionEvent::ConnectionFailed => {
                tracing::error!(call_id = %self.call_id, "recognition stream lost, caller can no longer be heard");
            }
        }
    }

    async fn on_transcript(&mut self, transcript: &TranscriptEvent) {
        let speaking = self.sequencer.is_speaking();
        let outcome = self.aggregator.observe(transcript, speaking);

        if outcome.utterance_started {
            self.tracker.transcription_started();
        }

        if outcome.barge_in {
            let playing = self.sequencer.last_played();
            if self.sequencer.barge_in().await {
                self.interrupted = true;
                if let Some(interaction) = playing
                    && let Some(record) = self.tracker.turn_interrupted(interaction)
                {
                    tracing::info!(
                        call_id = %self.call_id,
                        interaction = record.interaction_index,
                        "reply interrupted by caller"
                    );
                }
            }
            self.collect_delivered();
        }

        if let Some(turn) = outcome.completed {
            self.begin_turn(turn);
        }
    }

    fn begin_turn(&mut self, turn: CompletedTurn) {
        tracing::info!(
            call_id = %self.call_id,
            interaction = turn.interaction_index,
            text = %turn.text,
            "caller turn complete"
        );
        self.tracker.turn_started(turn.interaction_index, &turn.text);
        self.request_reply(turn.interaction_index, turn.text);
        self.publish();
    }

    fn request_reply(&mut self, interaction: u64, text: String) {
        let request = CompletionRequest {
            interaction,
            text,
            interruption: std::mem::take(&mut self.interrupted),
            context: Arc::clone(&self.context),
        };
        self.completion.spawn(request, self.completion_tx.clone());
    }

    async fn on_completion(&mut self, event: CompletionEvent) {
        match event {
            CompletionEvent::Fragment(fragment) => {
                self.tracker.first_fragment(fragment.interaction_index);

                if fragment.interaction_index < self.sequencer.current_interaction() {
                    tracing::debug!(
                        interaction = fragment.interaction_index,
                        "skipping synthesis for superseded turn"
                    );
                    return;
                }

                let (interaction, index) = (fragment.interaction_index, fragment.fragment_index);
                let submission = self.synthesis.submit(fragment, self.synthesis_tx.clone());
                if matches!(submission, Submission::Duplicate) {
                    self.sequencer.complete_fragment(interaction, index).await;
                }
            }
            CompletionEvent::Finished {
                interaction,
                fragment_count,
            } => {
                tracing::debug!(interaction, fragment_count, "reply fully generated");
                self.sequencer.finish_turn(interaction, fragment_count).await;
            }
        }
        self.collect_delivered();
    }

    async fn on_synthesis(&mut self, event: SynthesisEvent) {
        match event {
            SynthesisEvent::Chunk(chunk) => {
                self.sequencer
                    .deliver_chunk(chunk.interaction_index, chunk.fragment_index, chunk.payload)
                    .await;
            }
            SynthesisEvent::Completed {
                interaction,
                fragment,
                ..
            }
            | SynthesisEvent::Error {
                interaction,
                fragment,
            } => {
                self.sequencer.complete_fragment(interaction, fragment).await;
            }
        }
        self.collect_delivered();
    }

    /// Speak text outside the turn sequence
    async fn announce(&mut self, text: String) {
        let fragment = ReplyFragment {
            interaction_index: self.sequencer.current_interaction(),
            fragment_index: None,
            text,
        };
        let interaction = fragment.interaction_index;
        let submission = self.synthesis.submit(fragment, self.synthesis_tx.clone());
        if matches!(submission, Submission::Duplicate) {
            self.sequencer.complete_fragment(interaction, None).await;
        }
    }

    /// Close out metrics for turns the sequencer finished delivering
    fn collect_delivered(&mut self) {
        let delivered = self.sequencer.take_delivered();
        if delivered.is_empty() {
            return;
        }
        for interaction in delivered {
            if let Some(record) = self.tracker.turn_delivered(interaction) {
                tracing::info!(
                    call_id = %self.call_id,
                    interaction,
                    transcription_ms = record.transcription_time_ms,
                    gpt_ms = record.gpt_time_ms,
                    tts_ms = record.tts_time_ms,
                    round_trip_ms = record.round_trip_time_ms,
                    "turn delivered"
                );
            }
        }
        self.publish();
    }

    fn snapshot(&self, active: bool) -> SessionSnapshot {
        let turns = self.tracker.history().to_vec();
        SessionSnapshot {
            call_id: self.call_id.clone(),
            stream_id: self.stream_id.clone(),
            started_at: self.started_at,
            ended_at: (!active).then(Utc::now),
            active,
            speaking: self.sequencer.outstanding_marks() > 0,
            caller: self.context.details.clone(),
            metrics: CallMetrics::from_turns(&turns),
            turns,
        }
    }

    fn publish(&self) {
        self.registry.publish(self.snapshot(true));
    }

    fn teardown(self) -> CallMetrics {
        self.recognition.close();
        self.completion.end_call(&self.call_id);

        let snapshot = self.snapshot(false);
        let metrics = snapshot.metrics.clone();
        tracing::info!(
            call_id = %self.call_id,
            turns = metrics.turns,
            avg_transcription_ms = metrics.avg_transcription_ms,
            avg_gpt_ms = metrics.avg_gpt_ms,
            avg_tts_ms = metrics.avg_tts_ms,
            avg_round_trip_ms = metrics.avg_round_trip_ms,
            call_ms = self.tracker.call_elapsed_ms(),
            "call ended"
        );
        self.registry.finish(snapshot);
        metrics
    }
}

/// Caller details from the start event, for logging
fn describe_caller(details: &HashMap<String, String>) -> String {
    let mut pairs: Vec<_> = details.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    pairs.join(", ")
}
