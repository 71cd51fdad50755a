//! Fragment synthesis
//!
//! Each reply fragment is synthesized in its own task. Audio is forwarded to
//! the session as numbered sub-chunks, either as the synthesizer produces them
//! or once the whole fragment has been downloaded.

mod elevenlabs;

pub use elevenlabs::ElevenLabsSynthesizer;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::completion::ReplyFragment;
use crate::config::{SynthesisConfig, SynthesisMode};
use crate::Result;

/// Text-to-speech backend producing audio in the bridge encoding
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Start synthesizing `text`, returning the audio as it arrives
    async fn synthesize(&self, text: &str) -> Result<BoxStream<'static, Result<Bytes>>>;
}

/// Synthesize a whole text into one buffer
///
/// # Errors
///
/// Returns error if the synthesizer fails before or during the stream
pub async fn synthesize_all(synthesizer: &dyn SpeechSynthesizer, text: &str) -> Result<Vec<u8>> {
    let mut stream = synthesizer.synthesize(text).await?;
    let mut audio = Vec::new();
    while let Some(chunk) = stream.next().await {
        audio.extend_from_slice(&chunk?);
    }
    Ok(audio)
}

/// A piece of synthesized audio for one fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSubChunk {
    pub interaction_index: u64,
    pub fragment_index: Option<u32>,
    pub chunk_sequence: u32,
    pub payload: Bytes,
}

/// Output of a synthesis task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisEvent {
    Chunk(AudioSubChunk),
    /// All audio for the fragment has been emitted
    Completed {
        interaction: u64,
        fragment: Option<u32>,
        chunks: u32,
    },
    /// Synthesis failed; any audio still to come for the fragment is skipped
    Error { interaction: u64, fragment: Option<u32> },
}

/// Result of submitting a fragment
#[derive(Debug)]
pub enum Submission {
    /// Same text as the previous fragment, nothing to synthesize
    Duplicate,
    Spawned(JoinHandle<()>),
}

/// Starts one synthesis task per fragment and suppresses duplicates
pub struct SynthesisStreamer {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    mode: SynthesisMode,
    dedup_prefix_chars: usize,
    last_prefix: Option<String>,
}

impl SynthesisStreamer {
    #[must_use]
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, config: &SynthesisConfig) -> Self {
        Self {
            synthesizer,
            mode: config.mode,
            dedup_prefix_chars: config.dedup_prefix_chars,
            last_prefix: None,
        }
    }

    /// Synthesize a fragment in the background
    ///
    /// A fragment whose leading text matches the previous fragment is treated
    /// as already satisfied and returns [`Submission::Duplicate`] without
    /// calling the synthesizer.
    pub fn submit(
        &mut self,
        fragment: ReplyFragment,
        events: mpsc::Sender<SynthesisEvent>,
    ) -> Submission {
        let prefix: String = fragment.text.chars().take(self.dedup_prefix_chars).collect();
        if self.last_prefix.as_deref() == Some(prefix.as_str()) {
            tracing::debug!(
                interaction = fragment.interaction_index,
                fragment = ?fragment.fragment_index,
                "duplicate fragment suppressed"
            );
            return Submission::Duplicate;
        }
        self.last_prefix = Some(prefix);

        let synthesizer = Arc::clone(&self.synthesizer);
        let mode = self.mode;
        Submission::Spawned(tokio::spawn(async move {
            run_fragment(synthesizer.as_ref(), mode, fragment, &events).await;
        }))
    }
}

async fn run_fragment(
    synthesizer: &dyn SpeechSynthesizer,
    mode: SynthesisMode,
    fragment: ReplyFragment,
    events: &mpsc::Sender<SynthesisEvent>,
) {
    let interaction = fragment.interaction_index;
    let index = fragment.fragment_index;
    let mut sequence = 0;

    let outcome = match synthesizer.synthesize(&fragment.text).await {
        Ok(stream) => match mode {
            SynthesisMode::Streaming => forward_streaming(stream, &fragment, &mut sequence, events).await,
            SynthesisMode::Buffered => forward_buffered(stream, &fragment, &mut sequence, events).await,
        },
        Err(e) => Err(e),
    };

    let event = match outcome {
        Ok(()) => SynthesisEvent::Completed {
            interaction,
            fragment: index,
            chunks: sequence,
        },
        Err(e) => {
            tracing::error!(interaction, fragment = ?index, error = %e, "synthesis failed");
            SynthesisEvent::Error {
                interaction,
                fragment: index,
            }
        }
    };
    let _ = events.send(event).await;
}

fn sub_chunk(fragment: &ReplyFragment, sequence: &mut u32, payload: Bytes) -> SynthesisEvent {
    let chunk = AudioSubChunk {
        interaction_index: fragment.interaction_index,
        fragment_index: fragment.fragment_index,
        chunk_sequence: *sequence,
        payload,
    };
    *sequence += 1;
    SynthesisEvent::Chunk(chunk)
}

async fn forward_streaming(
    mut stream: BoxStream<'static, Result<Bytes>>,
    fragment: &ReplyFragment,
    sequence: &mut u32,
    events: &mpsc::Sender<SynthesisEvent>,
) -> Result<()> {
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        if events.send(sub_chunk(fragment, sequence, chunk)).await.is_err() {
            break;
        }
    }
    Ok(())
}

async fn forward_buffered(
    mut stream: BoxStream<'static, Result<Bytes>>,
    fragment: &ReplyFragment,
    sequence: &mut u32,
    events: &mpsc::Sender<SynthesisEvent>,
) -> Result<()> {
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if !chunk.is_empty() {
            chunks.push(chunk);
        }
    }

    for chunk in chunks {
        if events.send(sub_chunk(fragment, sequence, chunk)).await.is_err() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::Error;

    /// Yields two chunks, optionally failing after the first
    struct FakeSynth {
        calls: AtomicUsize,
        fail_midway: bool,
        fail_upfront: bool,
    }

    impl FakeSynth {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_midway: false,
                fail_upfront: false,
            })
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeSynth {
        async fn synthesize(&self, text: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_upfront {
                return Err(Error::Synthesis("quota exceeded".to_string()));
            }
            let first = Ok(Bytes::from(text.as_bytes().to_vec()));
            let second = if self.fail_midway {
                Err(Error::Synthesis("stream reset".to_string()))
            } else {
                Ok(Bytes::from_static(b"-end"))
            };
            Ok(futures::stream::iter(vec![first, second]).boxed())
        }
    }

    fn fragment(index: u32, text: &str) -> ReplyFragment {
        ReplyFragment {
            interaction_index: 1,
            fragment_index: Some(index),
            text: text.to_string(),
        }
    }

    fn streamer(synth: Arc<FakeSynth>, mode: SynthesisMode) -> SynthesisStreamer {
        let config = SynthesisConfig {
            mode,
            ..SynthesisConfig::default()
        };
        SynthesisStreamer::new(synth, &config)
    }

    async fn run(streamer: &mut SynthesisStreamer, fragment: ReplyFragment) -> Vec<SynthesisEvent> {
        let (tx, mut rx) = mpsc::channel(16);
        match streamer.submit(fragment, tx) {
            Submission::Spawned(handle) => handle.await.unwrap(),
            Submission::Duplicate => return Vec::new(),
        }
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn streaming_numbers_sub_chunks() {
        let mut streamer = streamer(FakeSynth::new(), SynthesisMode::Streaming);
        let events = run(&mut streamer, fragment(2, "hi")).await;

        assert_eq!(events.len(), 3);
        let SynthesisEvent::Chunk(first) = &events[0] else {
            panic!("expected chunk");
        };
        assert_eq!(first.fragment_index, Some(2));
        assert_eq!(first.chunk_sequence, 0);
        assert_eq!(first.payload, Bytes::from_static(b"hi"));
        assert!(matches!(&events[1], SynthesisEvent::Chunk(c) if c.chunk_sequence == 1));
        assert_eq!(
            events[2],
            SynthesisEvent::Completed {
                interaction: 1,
                fragment: Some(2),
                chunks: 2
            }
        );
    }

    #[tokio::test]
    async fn duplicate_text_calls_synthesizer_once() {
        let synth = FakeSynth::new();
        let mut streamer = streamer(Arc::clone(&synth), SynthesisMode::Streaming);

        let (tx, _rx) = mpsc::channel(16);
        let first = streamer.submit(fragment(0, "One moment please"), tx.clone());
        let second = streamer.submit(fragment(1, "One moment please"), tx.clone());
        assert!(matches!(second, Submission::Duplicate));
        if let Submission::Spawned(handle) = first {
            handle.await.unwrap();
        }
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);

        let third = streamer.submit(fragment(2, "Anything else?"), tx);
        assert!(matches!(third, Submission::Spawned(_)));
    }

    #[tokio::test]
    async fn dedup_compares_leading_characters_only() {
        let synth = FakeSynth::new();
        let config = SynthesisConfig {
            dedup_prefix_chars: 5,
            ..SynthesisConfig::default()
        };
        let mut streamer = SynthesisStreamer::new(synth, &config);

        let (tx, _rx) = mpsc::channel(16);
        let _ = streamer.submit(fragment(0, "Hello Ada"), tx.clone());
        assert!(matches!(
            streamer.submit(fragment(1, "Hello Bob"), tx),
            Submission::Duplicate
        ));
    }

    #[tokio::test]
    async fn upfront_error_produces_no_audio() {
        let synth = Arc::new(FakeSynth {
            calls: AtomicUsize::new(0),
            fail_midway: false,
            fail_upfront: true,
        });
        let mut streamer = streamer(synth, SynthesisMode::Streaming);
        let events = run(&mut streamer, fragment(0, "hi")).await;

        assert_eq!(
            events,
            vec![SynthesisEvent::Error {
                interaction: 1,
                fragment: Some(0)
            }]
        );
    }

    #[tokio::test]
    async fn buffered_mode_drops_partial_audio_on_error() {
        let synth = Arc::new(FakeSynth {
            calls: AtomicUsize::new(0),
            fail_midway: true,
            fail_upfront: false,
        });
        let mut streamer = streamer(synth, SynthesisMode::Buffered);
        let events = run(&mut streamer, fragment(0, "hi")).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SynthesisEvent::Error { .. }));
    }

    #[tokio::test]
    async fn buffered_mode_preserves_sequence() {
        let mut streamer = streamer(FakeSynth::new(), SynthesisMode::Buffered);
        let events = run(&mut streamer, fragment(0, "hi")).await;

        let sequences: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                SynthesisEvent::Chunk(c) => Some(c.chunk_sequence),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![0, 1]);
    }
}
