//! ElevenLabs streaming text-to-speech

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use super::SpeechSynthesizer;
use crate::config::SynthesisConfig;
use crate::{Error, Result};

#[derive(Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
    use_speaker_boost: bool,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

/// Synthesizes telephony-encoded speech with ElevenLabs
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    voice_id: String,
    model_id: String,
    output_format: String,
    stability: f32,
    similarity_boost: f32,
}

impl ElevenLabsSynthesizer {
    /// Create a synthesizer from synthesis settings
    ///
    /// # Errors
    ///
    /// Returns error if the API key or voice is missing
    pub fn new(client: reqwest::Client, config: &SynthesisConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("ElevenLabs API key required for TTS".to_string()))?;
        let voice_id = config
            .voice_id
            .clone()
            .ok_or_else(|| Error::Config("ElevenLabs voice id required for TTS".to_string()))?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            voice_id,
            model_id: config.model_id.clone(),
            output_format: config.output_format.clone(),
            stability: config.stability,
            similarity_boost: config.similarity_boost,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let url = format!(
            "{}/text-to-speech/{}/stream",
            self.base_url, self.voice_id
        );

        let request = SpeechRequest {
            text,
            model_id: &self.model_id,
            voice_settings: VoiceSettings {
                stability: self.stability,
                similarity_boost: self.similarity_boost,
                use_speaker_boost: true,
            },
        };

        tracing::debug!(chars = text.chars().count(), "requesting ElevenLabs speech");

        let response = self
            .client
            .post(&url)
            .query(&[("output_format", self.output_format.as_str())])
            .header("xi-api-key", self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!("ElevenLabs TTS error {status}: {body}")));
        }

        Ok(response.bytes_stream().map(|r| r.map_err(Error::from)).boxed())
    }
}
