//! Completion streaming
//!
//! Sends a finished turn to the language model and turns the reply into an
//! ordered sequence of speakable fragments. Backends may answer with a whole
//! string or a token stream; both go through the same [`FragmentSplitter`].

mod external;
mod openai;
mod splitter;

pub use external::ExternalModel;
pub use openai::OpenAiModel;
pub use splitter::FragmentSplitter;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::config::{CompletionBackend, CompletionConfig};
use crate::{Error, Result};

/// Per-call context forwarded with every completion request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerContext {
    pub session_id: String,
    /// Caller details attached to the stream by the telephony bridge
    pub details: HashMap<String, String>,
}

/// One turn's input to the language model
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub interaction: u64,
    pub text: String,
    /// The caller interrupted the previous reply
    pub interruption: bool,
    pub context: Arc<CallerContext>,
}

/// Reply from a language model backend
pub enum ModelResponse {
    /// Complete reply text
    Whole(String),
    /// Incremental text deltas
    Stream(BoxStream<'static, Result<String>>),
}

impl std::fmt::Debug for ModelResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Whole(text) => f.debug_tuple("Whole").field(text).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Language model backend
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Request a reply for one turn
    async fn respond(&self, request: &CompletionRequest) -> Result<ModelResponse>;

    /// Prepare per-call state before the first turn of a session
    fn begin_call(&self, _session_id: &str) {}

    /// Record a reply that was fully received, for backends that keep history
    fn remember(&self, _request: &CompletionRequest, _reply: &str) {}

    /// Drop any per-call state kept for a session
    fn end_call(&self, _session_id: &str) {}
}

/// Build the configured language model backend
///
/// # Errors
///
/// Returns error if the selected backend is missing its endpoint or key
pub fn language_model(
    config: &CompletionConfig,
    client: reqwest::Client,
) -> Result<Arc<dyn LanguageModel>> {
    match config.backend {
        CompletionBackend::External => {
            let url = config.external_url.clone().ok_or_else(|| {
                Error::Config("GPT_API_URL is required for the external backend".to_string())
            })?;
            Ok(Arc::new(ExternalModel::new(client, url)))
        }
        CompletionBackend::OpenAi => Ok(Arc::new(OpenAiModel::new(client, config)?)),
    }
}

/// A speakable chunk of a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFragment {
    pub interaction_index: u64,
    /// Position within the turn; `None` for out-of-band audio
    pub fragment_index: Option<u32>,
    pub text: String,
}

/// Output of a completion task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionEvent {
    Fragment(ReplyFragment),
    /// Every fragment of the turn has been emitted
    Finished { interaction: u64, fragment_count: u32 },
}

/// Splitting and pacing knobs
#[derive(Debug, Clone)]
struct StreamerSettings {
    pause_marker: char,
    fragment_target_chars: usize,
    interruption_target_chars: usize,
    pacing: Duration,
    interruption_pacing: Duration,
    fallback_text: String,
}

/// Runs completions and emits reply fragments
#[derive(Clone)]
pub struct CompletionStreamer {
    model: Arc<dyn LanguageModel>,
    settings: StreamerSettings,
}

impl CompletionStreamer {
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>, config: &CompletionConfig) -> Self {
        Self {
            model,
            settings: StreamerSettings {
                pause_marker: config.pause_marker,
                fragment_target_chars: config.fragment_target_chars,
                interruption_target_chars: config.interruption_target_chars,
                pacing: config.pacing,
                interruption_pacing: config.interruption_pacing,
                fallback_text: config.fallback_text.clone(),
            },
        }
    }

    /// Run one completion in a background task
    pub fn spawn(
        &self,
        request: CompletionRequest,
        events: mpsc::Sender<CompletionEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let streamer = self.clone();
        tokio::spawn(async move { streamer.run(request, events).await })
    }

    /// Set up per-call backend state
    pub fn begin_call(&self, session_id: &str) {
        self.model.begin_call(session_id);
    }

    /// Drop per-call backend state
    pub fn end_call(&self, session_id: &str) {
        self.model.end_call(session_id);
    }

    /// Run one completion to the end, emitting fragments as they are cut
    ///
    /// Never fails: any backend error is logged and replaced by a single
    /// fallback fragment. Stops early, without recording the reply, once the
    /// session's mailbox is closed.
    pub async fn run(&self, request: CompletionRequest, events: mpsc::Sender<CompletionEvent>) {
        let interaction = request.interaction;
        let (target, pacing) = if request.interruption {
            (self.settings.interruption_target_chars, self.settings.interruption_pacing)
        } else {
            (self.settings.fragment_target_chars, self.settings.pacing)
        };

        let mut emitter = FragmentEmitter {
            interaction,
            next_fragment: 0,
            events,
        };
        let mut splitter = FragmentSplitter::new(self.settings.pause_marker, target);

        let result = match self.model.respond(&request).await {
            Ok(ModelResponse::Whole(text)) => {
                emit_paced(&mut emitter, &mut splitter, &text, pacing).await
            }
            Ok(ModelResponse::Stream(stream)) => emit_streamed(&mut emitter, &mut splitter, stream).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(Some(reply)) => self.model.remember(&request, &reply),
            Ok(None) => {
                tracing::debug!(interaction, "session gone, abandoning completion");
                return;
            }
            Err(e) => {
                tracing::error!(interaction, error = %e, "completion failed, sending fallback");
                emitter.emit(self.settings.fallback_text.clone()).await;
            }
        }

        let fragment_count = emitter.next_fragment;
        tracing::debug!(interaction, fragment_count, "completion finished");
        let _ = emitter
            .events
            .send(CompletionEvent::Finished {
                interaction,
                fragment_count,
            })
            .await;
    }
}

/// Assigns fragment indices in emission order
struct FragmentEmitter {
    interaction: u64,
    next_fragment: u32,
    events: mpsc::Sender<CompletionEvent>,
}

impl FragmentEmitter {
    /// Returns false once the session is no longer listening
    async fn emit(&mut self, text: String) -> bool {
        let fragment = ReplyFragment {
            interaction_index: self.interaction,
            fragment_index: Some(self.next_fragment),
            text,
        };
        self.next_fragment += 1;
        self.events.send(CompletionEvent::Fragment(fragment)).await.is_ok()
    }
}

/// Emit a whole-string reply with a pause between fragments
///
/// `Ok(None)` means the session went away before the reply was out.
async fn emit_paced(
    emitter: &mut FragmentEmitter,
    splitter: &mut FragmentSplitter,
    text: &str,
    pacing: Duration,
) -> Result<Option<String>> {
    if text.trim().is_empty() {
        return Err(Error::Completion("empty reply from language model".to_string()));
    }

    let mut fragments = splitter.push(text);
    fragments.extend(splitter.finish());

    for (i, fragment) in fragments.into_iter().enumerate() {
        if i > 0 && !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
        if !emitter.emit(fragment).await {
            return Ok(None);
        }
    }
    Ok(Some(text.to_string()))
}

/// Emit fragments as soon as streamed text crosses a boundary
async fn emit_streamed(
    emitter: &mut FragmentEmitter,
    splitter: &mut FragmentSplitter,
    mut stream: BoxStream<'static, Result<String>>,
) -> Result<Option<String>> {
    let mut reply = String::new();
    while let Some(delta) = stream.next().await {
        let delta = delta?;
        reply.push_str(&delta);
        for fragment in splitter.push(&delta) {
            if !emitter.emit(fragment).await {
                return Ok(None);
            }
        }
    }

    if let Some(rest) = splitter.finish()
        && !emitter.emit(rest).await
    {
        return Ok(None);
    }
    if reply.trim().is_empty() {
        return Err(Error::Completion("empty reply from language model".to_string()));
    }
    Ok(Some(reply))
}
