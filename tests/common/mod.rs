//! Shared test utilities

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use switchboard::pipeline::{
    CompletionRequest, LanguageModel, ModelResponse, RecognitionAdapter, RecognitionEvent,
    SpeechRecognizer, SpeechSynthesizer,
};
use switchboard::session::CallServices;
use switchboard::telephony::StartMeta;
use switchboard::{Config, Error, OutboundEvent, Result};
use tokio::sync::{mpsc, oneshot};

/// Recognizer that hands its event sender to the test instead of connecting
pub struct FakeRecognizer {
    events: Mutex<Option<oneshot::Sender<mpsc::Sender<RecognitionEvent>>>>,
    fail: bool,
}

impl FakeRecognizer {
    /// A recognizer plus the receiver of its event sender
    pub fn new() -> (Self, oneshot::Receiver<mpsc::Sender<RecognitionEvent>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                events: Mutex::new(Some(tx)),
                fail: false,
            },
            rx,
        )
    }

    /// A recognizer whose stream can never be opened
    pub fn unreachable() -> Self {
        Self {
            events: Mutex::new(None),
            fail: true,
        }
    }
}

#[async_trait]
impl SpeechRecognizer for FakeRecognizer {
    async fn open(&self, events: mpsc::Sender<RecognitionEvent>) -> Result<RecognitionAdapter> {
        if self.fail {
            return Err(Error::Recognition("connection refused".to_string()));
        }
        if let Some(tx) = self.events.lock().unwrap().take() {
            let _ = tx.send(events);
        }
        Ok(RecognitionAdapter::disconnected())
    }
}

/// Language model answering from a fixed script, recording every request
#[derive(Default)]
pub struct ScriptedModel {
    replies: HashMap<String, String>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: &[(&str, &str)]) -> Self {
        Self {
            replies: replies
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn respond(&self, request: &CompletionRequest) -> Result<ModelResponse> {
        self.requests.lock().unwrap().push(request.clone());
        match self.replies.get(&request.text) {
            Some(reply) => Ok(ModelResponse::Whole(reply.clone())),
            None => Err(Error::Completion(format!("no scripted reply for {:?}", request.text))),
        }
    }
}

/// Synthesizer whose audio is the fragment text itself
///
/// Texts listed in `delays` take that long before producing audio.
#[derive(Default)]
pub struct EchoSynthesizer {
    delays: HashMap<String, Duration>,
}

impl EchoSynthesizer {
    pub fn with_delays(delays: &[(&str, Duration)]) -> Self {
        Self {
            delays: delays.iter().map(|(k, d)| ((*k).to_string(), *d)).collect(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for EchoSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        if let Some(delay) = self.delays.get(text) {
            tokio::time::sleep(*delay).await;
        }
        let audio = Bytes::from(text.to_string());
        Ok(futures::stream::iter(vec![Ok(audio)]).boxed())
    }
}

/// Configuration with credentials filled in and pacing disabled
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.completion.pacing = Duration::ZERO;
    config.completion.interruption_pacing = Duration::ZERO;
    config
}

pub fn services(
    recognizer: impl SpeechRecognizer + 'static,
    model: Arc<ScriptedModel>,
    synthesizer: impl SpeechSynthesizer + 'static,
) -> CallServices {
    CallServices {
        recognizer: Arc::new(recognizer),
        model,
        synthesizer: Arc::new(synthesizer),
    }
}

pub fn start_meta(call_sid: &str) -> StartMeta {
    StartMeta {
        stream_sid: format!("MZ{call_sid}"),
        call_sid: call_sid.to_string(),
        custom_parameters: HashMap::from([("callerName".to_string(), "Ada".to_string())]),
    }
}

/// Decoded text of a media event, `None` for other events
pub fn media_text(event: &OutboundEvent) -> Option<String> {
    match event {
        OutboundEvent::Media { media, .. } => {
            let audio = STANDARD.decode(&media.payload).ok()?;
            String::from_utf8(audio).ok()
        }
        _ => None,
    }
}

/// Collect outbound events until `count` media frames have been seen
pub async fn collect_media(
    outbound: &mut mpsc::Receiver<OutboundEvent>,
    count: usize,
) -> Vec<OutboundEvent> {
    let mut events = Vec::new();
    let mut media = 0;
    while media < count {
        let event = tokio::time::timeout(Duration::from_secs(30), outbound.recv())
            .await
            .expect("timed out waiting for outbound audio")
            .expect("outbound channel closed");
        if matches!(event, OutboundEvent::Media { .. }) {
            media += 1;
        }
        events.push(event);
    }
    events
}
