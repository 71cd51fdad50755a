//! Streaming speech recognition
//!
//! Caller audio is forwarded to a Deepgram live transcription socket. Results
//! are normalized into [`TranscriptEvent`]s and pushed to the session. Sending
//! audio never fails: a broken stream is reported once as
//! [`RecognitionEvent::ConnectionFailed`] and further audio is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use super::turn::TranscriptEvent;
use crate::config::RecognitionConfig;
use crate::{Error, Result};

/// Frames of caller audio buffered toward the recognizer
const AUDIO_BUFFER_FRAMES: usize = 256;

const KEEPALIVE_MESSAGE: &str = r#"{"type":"KeepAlive"}"#;
const CLOSE_STREAM_MESSAGE: &str = r#"{"type":"CloseStream"}"#;

/// Event from the recognizer to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Transcript(TranscriptEvent),
    /// The stream failed and will not recover
    ConnectionFailed,
}

/// Opens recognition streams
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Open a stream that reports to `events`
    async fn open(&self, events: mpsc::Sender<RecognitionEvent>) -> Result<RecognitionAdapter>;
}

/// Handle for pushing caller audio into an open recognition stream
#[derive(Debug)]
pub struct RecognitionAdapter {
    audio: mpsc::Sender<Bytes>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl RecognitionAdapter {
    /// Run a recognition stream over an established WebSocket
    pub fn spawn<S>(
        ws: WebSocketStream<S>,
        events: mpsc::Sender<RecognitionEvent>,
        keepalive: Duration,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (audio, audio_rx) = mpsc::channel(AUDIO_BUFFER_FRAMES);
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        tokio::spawn(run_stream(
            ws,
            audio_rx,
            events,
            Arc::clone(&closed),
            Arc::clone(&shutdown),
            keepalive,
        ));

        Self {
            audio,
            closed,
            shutdown,
        }
    }

    /// An adapter with no recognizer behind it, used when the stream could not be opened
    #[must_use]
    pub fn disconnected() -> Self {
        let (audio, _) = mpsc::channel(1);
        Self {
            audio,
            closed: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Forward one base64 encoded audio frame
    ///
    /// Frames are dropped while the stream is closed, malformed or backed up.
    pub fn send(&self, payload: &str) {
        if !self.is_open() {
            return;
        }

        let audio = match STANDARD.decode(payload) {
            Ok(audio) => audio,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable audio frame");
                return;
            }
        };

        if let Err(e) = self.audio.try_send(Bytes::from(audio)) {
            tracing::debug!(error = %e, "recognizer not keeping up, dropping audio frame");
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Finish the stream; keep-alives stop immediately
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.notify_one();
        }
    }
}

impl Drop for RecognitionAdapter {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_stream<S>(
    ws: WebSocketStream<S>,
    mut audio: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<RecognitionEvent>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    keepalive: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);

    let failure = loop {
        tokio::select! {
            () = shutdown.notified() => {
                let _ = sink.send(Message::Text(CLOSE_STREAM_MESSAGE.into())).await;
                let _ = sink.close().await;
                tracing::debug!("recognition stream closed");
                return;
            }
            Some(frame) = audio.recv() => {
                if let Err(e) = sink.send(Message::Binary(frame)).await {
                    break e.to_string();
                }
            }
            _ = ticker.tick() => {
                if closed.load(Ordering::Acquire) {
                    continue;
                }
                tracing::trace!("recognizer keepalive");
                if let Err(e) = sink.send(Message::Text(KEEPALIVE_MESSAGE.into())).await {
                    break e.to_string();
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = parse_message(&text)
                        && events.send(RecognitionEvent::Transcript(event)).await.is_err()
                    {
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break format!("closed by recognizer: {frame:?}");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
                None => break "stream ended".to_string(),
            },
        }
    };

    if closed.swap(true, Ordering::AcqRel) {
        return;
    }
    tracing::error!(reason = %failure, "recognition connection failed");
    let _ = events.send(RecognitionEvent::ConnectionFailed).await;
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum DeepgramMessage {
    Results {
        channel: DeepgramChannel,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        speech_final: bool,
    },
    UtteranceEnd,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Debug, Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// Normalize one recognizer message; `None` for messages the session ignores
fn parse_message(text: &str) -> Option<TranscriptEvent> {
    let message: DeepgramMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable recognizer message");
            return None;
        }
    };

    match message {
        DeepgramMessage::Results {
            channel,
            is_final,
            speech_final,
        } => {
            let transcript = channel
                .alternatives
                .into_iter()
                .next()
                .map(|a| a.transcript)
                .unwrap_or_default();
            if transcript.trim().is_empty() && !speech_final {
                return None;
            }
            Some(TranscriptEvent {
                text: transcript,
                is_final,
                is_speech_final: speech_final,
                is_utterance_end: false,
            })
        }
        DeepgramMessage::UtteranceEnd => Some(TranscriptEvent::utterance_end()),
        DeepgramMessage::Other => None,
    }
}

/// Deepgram live transcription client
pub struct DeepgramRecognizer {
    api_key: SecretString,
    config: RecognitionConfig,
}

impl DeepgramRecognizer {
    /// Create a recognizer from recognition settings
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(config: &RecognitionConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("Deepgram API key required".to_string()))?;

        Ok(Self {
            api_key,
            config: config.clone(),
        })
    }

    /// Live transcription URL with the stream parameters
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is invalid
    pub fn stream_url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.config.base_url)
            .map_err(|e| Error::Config(format!("invalid recognition url: {e}")))?;

        url.query_pairs_mut()
            .append_pair("encoding", &self.config.encoding)
            .append_pair("sample_rate", &self.config.sample_rate.to_string())
            .append_pair("channels", "1")
            .append_pair("language", &self.config.language)
            .append_pair("model", &self.config.model)
            .append_pair("punctuate", "true")
            .append_pair("interim_results", "true")
            .append_pair("endpointing", &self.config.endpointing_ms.to_string())
            .append_pair("utterance_end_ms", &self.config.utterance_end_ms.to_string());

        Ok(url)
    }
}

#[async_trait]
impl SpeechRecognizer for DeepgramRecognizer {
    async fn open(&self, events: mpsc::Sender<RecognitionEvent>) -> Result<RecognitionAdapter> {
        let url = self.stream_url()?;
        let mut request = url.as_str().into_client_request()?;
        let token = HeaderValue::from_str(&format!("Token {}", self.api_key.expose_secret()))
            .map_err(|e| Error::Config(format!("invalid Deepgram API key: {e}")))?;
        request.headers_mut().insert("Authorization", token);

        let (ws, _) = tokio_tungstenite::connect_async(request).await.map_err(|e| {
            tracing::error!(error = %e, "Deepgram connection failed");
            Error::Recognition(e.to_string())
        })?;

        tracing::info!(model = %self.config.model, "Deepgram connected");
        Ok(RecognitionAdapter::spawn(ws, events, self.config.keepalive))
    }
}
