//! Configuration management for the switchboard gateway
//!
//! Values resolve as env > TOML file > default. A `.env` file in the working
//! directory is loaded into the process environment by the binary before
//! [`Config::load`] runs.

pub mod file;

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::{Error, Result};
use file::SwitchboardConfigFile;

/// Default pause marker the model is prompted to insert between speakable fragments
pub const DEFAULT_PAUSE_MARKER: char = '•';

/// Default spoken reply when the language model fails
pub const DEFAULT_FALLBACK_TEXT: &str = "I'm sorry, there was an error processing your request.";

/// Switchboard gateway configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// HTTP/WebSocket server configuration
    pub server: ServerConfig,

    /// Streaming speech recognition
    pub recognition: RecognitionConfig,

    /// Language model
    pub completion: CompletionConfig,

    /// Speech synthesis
    pub synthesis: SynthesisConfig,

    /// Playback sequencing and barge-in
    pub playback: PlaybackConfig,

    /// Per-call behaviour
    pub call: CallConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Public hostname the telephony bridge streams media to
    pub public_host: Option<String>,

    /// Request budget for the HTTP API
    pub requests_per_minute: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            public_host: None,
            requests_per_minute: 120,
        }
    }
}

/// Streaming recognizer configuration
#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub language: String,
    /// Wire encoding of caller audio (narrow-band telephony)
    pub encoding: String,
    pub sample_rate: u32,
    /// Silence after which the recognizer marks a result speech-final
    pub endpointing_ms: u32,
    /// Gap after which the recognizer emits an utterance-end signal
    pub utterance_end_ms: u32,
    pub keepalive: Duration,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "wss://api.deepgram.com/v1/listen".to_string(),
            model: "nova-3".to_string(),
            language: "multi".to_string(),
            encoding: "mulaw".to_string(),
            sample_rate: 8000,
            endpointing_ms: 200,
            utterance_end_ms: 1000,
            keepalive: Duration::from_secs(10),
        }
    }
}

/// Which language model backend serves completions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionBackend {
    /// HTTP service returning a whole reply string
    #[default]
    External,
    /// `OpenAI` chat completions with token streaming
    OpenAi,
}

impl FromStr for CompletionBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "external" => Ok(Self::External),
            "openai" => Ok(Self::OpenAi),
            other => Err(Error::Config(format!("unknown completion backend: {other}"))),
        }
    }
}

/// Language model configuration
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub backend: CompletionBackend,
    /// Endpoint of the external chat service
    pub external_url: Option<String>,
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub system_prompt: String,
    pub pause_marker: char,
    /// Pending text length that forces a fragment cut when no marker arrives
    pub fragment_target_chars: usize,
    /// Shorter cut length used right after a barge-in
    pub interruption_target_chars: usize,
    /// Delay between fragments of a whole-string reply
    pub pacing: Duration,
    pub interruption_pacing: Duration,
    pub fallback_text: String,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            backend: CompletionBackend::External,
            external_url: None,
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4-turbo".to_string(),
            max_tokens: 500,
            system_prompt: default_system_prompt(),
            pause_marker: DEFAULT_PAUSE_MARKER,
            fragment_target_chars: 60,
            interruption_target_chars: 30,
            pacing: Duration::from_millis(200),
            interruption_pacing: Duration::from_millis(50),
            fallback_text: DEFAULT_FALLBACK_TEXT.to_string(),
        }
    }
}

fn default_system_prompt() -> String {
    format!(
        "You are a friendly phone assistant. Keep each reply to two or three short \
         spoken sentences and never use markdown. Insert a '{DEFAULT_PAUSE_MARKER}' symbol \
         every 5 to 10 words at natural pauses where your response can be split for \
         text to speech."
    )
}

/// How synthesized audio is exposed to the sequencer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SynthesisMode {
    /// Forward sub-chunks as the synthesizer produces them
    #[default]
    Streaming,
    /// Download the whole fragment before emitting its sub-chunks
    Buffered,
}

impl FromStr for SynthesisMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "streaming" => Ok(Self::Streaming),
            "buffered" => Ok(Self::Buffered),
            other => Err(Error::Config(format!("unknown synthesis mode: {other}"))),
        }
    }
}

/// Speech synthesis configuration
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub voice_id: Option<String>,
    pub model_id: String,
    /// Must match the bridge encoding, the core never transcodes
    pub output_format: String,
    pub mode: SynthesisMode,
    /// Leading characters compared for duplicate suppression
    pub dedup_prefix_chars: usize,
    pub stability: f32,
    pub similarity_boost: f32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.elevenlabs.io/v1".to_string(),
            voice_id: None,
            model_id: "eleven_multilingual_v2".to_string(),
            output_format: "ulaw_8000".to_string(),
            mode: SynthesisMode::Streaming,
            dedup_prefix_chars: 100,
            stability: 0.3,
            similarity_boost: 0.5,
        }
    }
}

/// Playback sequencing and barge-in tuning
///
/// The barge-in length threshold and cooldown are heuristics; treat them as
/// tunables rather than protocol constants.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Trimmed transcript length above which speech counts as a barge-in
    pub barge_in_min_chars: usize,
    /// Minimum spacing between two clear commands
    pub barge_in_cooldown: Duration,
    /// Speaking state is dropped after this long without bridge activity
    pub inactivity_timeout: Duration,
    /// Capacity of each per-session mailbox
    pub mailbox_capacity: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            barge_in_min_chars: 5,
            barge_in_cooldown: Duration::from_millis(1000),
            inactivity_timeout: Duration::from_millis(20_000),
            mailbox_capacity: 64,
        }
    }
}

/// Per-call behaviour
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Spoken before anything else, outside the turn ordering
    pub announcement: Option<String>,
    /// Ask the model for a greeting as turn 0
    pub greet: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            announcement: None,
            greet: true,
        }
    }
}

/// Parse a value from the first source that yields one
fn parse_opt<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|s| s.trim().parse().ok())
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl Config {
    /// Load configuration from the environment and the TOML config file
    ///
    /// # Errors
    ///
    /// Returns error if an enumerated setting has an unknown value
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Merge a parsed config file with an environment lookup (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if an enumerated setting has an unknown value
    #[allow(clippy::too_many_lines)]
    pub fn from_sources<F>(fc: SwitchboardConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let SwitchboardConfigFile {
            server: fs,
            recognition: fr,
            completion: fcmp,
            synthesis: fsyn,
            playback: fp,
            call: fcall,
        } = fc;

        let server = {
            let d = ServerConfig::default();
            ServerConfig {
                port: parse_opt(env("SWITCHBOARD_PORT").or_else(|| env("PORT")))
                    .or(fs.port)
                    .unwrap_or(d.port),
                public_host: env("SERVER").or(fs.public_host),
                requests_per_minute: parse_opt(env("SWITCHBOARD_REQUESTS_PER_MINUTE"))
                    .or(fs.requests_per_minute)
                    .unwrap_or(d.requests_per_minute),
            }
        };

        let recognition = {
            let d = RecognitionConfig::default();
            RecognitionConfig {
                api_key: env("DEEPGRAM_API_KEY").or(fr.api_key).map(SecretString::from),
                base_url: env("DEEPGRAM_URL").or(fr.base_url).unwrap_or(d.base_url),
                model: env("DEEPGRAM_MODEL").or(fr.model).unwrap_or(d.model),
                language: env("DEEPGRAM_LANGUAGE").or(fr.language).unwrap_or(d.language),
                encoding: fr.encoding.unwrap_or(d.encoding),
                sample_rate: fr.sample_rate.unwrap_or(d.sample_rate),
                endpointing_ms: fr.endpointing_ms.unwrap_or(d.endpointing_ms),
                utterance_end_ms: parse_opt(env("DEEPGRAM_UTTERANCE_END_MS"))
                    .or(fr.utterance_end_ms)
                    .unwrap_or(d.utterance_end_ms),
                keepalive: fr.keepalive_secs.map_or(d.keepalive, Duration::from_secs),
            }
        };

        let completion = {
            let d = CompletionConfig::default();
            let backend = match env("SWITCHBOARD_COMPLETION_BACKEND").or(fcmp.backend) {
                Some(s) => s.parse()?,
                None => d.backend,
            };
            CompletionConfig {
                backend,
                external_url: env("GPT_API_URL").or(fcmp.external_url),
                api_key: env("OPENAI_API_KEY").or(fcmp.api_key).map(SecretString::from),
                base_url: env("OPENAI_BASE_URL").or(fcmp.base_url).unwrap_or(d.base_url),
                model: env("OPENAI_MODEL_ID").or(fcmp.model).unwrap_or(d.model),
                max_tokens: fcmp.max_tokens.unwrap_or(d.max_tokens),
                system_prompt: fcmp.system_prompt.unwrap_or(d.system_prompt),
                pause_marker: fcmp.pause_marker.unwrap_or(d.pause_marker),
                fragment_target_chars: fcmp
                    .fragment_target_chars
                    .unwrap_or(d.fragment_target_chars),
                interruption_target_chars: fcmp
                    .interruption_target_chars
                    .unwrap_or(d.interruption_target_chars),
                pacing: fcmp.pacing_ms.map_or(d.pacing, Duration::from_millis),
                interruption_pacing: fcmp
                    .interruption_pacing_ms
                    .map_or(d.interruption_pacing, Duration::from_millis),
                fallback_text: fcmp.fallback_text.unwrap_or(d.fallback_text),
            }
        };

        let synthesis = {
            let d = SynthesisConfig::default();
            let mode = match env("SWITCHBOARD_SYNTHESIS_MODE").or(fsyn.mode) {
                Some(s) => s.parse()?,
                None => d.mode,
            };
            SynthesisConfig {
                api_key: env("ELEVENLABS_API_KEY").or(fsyn.api_key).map(SecretString::from),
                base_url: env("ELEVENLABS_URL").or(fsyn.base_url).unwrap_or(d.base_url),
                voice_id: env("ELEVENLABS_VOICE_ID").or(fsyn.voice_id),
                model_id: env("ELEVENLABS_MODEL_ID").or(fsyn.model_id).unwrap_or(d.model_id),
                output_format: fsyn.output_format.unwrap_or(d.output_format),
                mode,
                dedup_prefix_chars: fsyn.dedup_prefix_chars.unwrap_or(d.dedup_prefix_chars),
                stability: fsyn.stability.unwrap_or(d.stability),
                similarity_boost: fsyn.similarity_boost.unwrap_or(d.similarity_boost),
            }
        };

        let playback = {
            let d = PlaybackConfig::default();
            PlaybackConfig {
                barge_in_min_chars: parse_opt(env("SWITCHBOARD_BARGE_IN_MIN_CHARS"))
                    .or(fp.barge_in_min_chars)
                    .unwrap_or(d.barge_in_min_chars),
                barge_in_cooldown: parse_opt(env("SWITCHBOARD_BARGE_IN_COOLDOWN_MS"))
                    .or(fp.barge_in_cooldown_ms)
                    .map_or(d.barge_in_cooldown, Duration::from_millis),
                inactivity_timeout: parse_opt(env("SWITCHBOARD_INACTIVITY_TIMEOUT_MS"))
                    .or(fp.inactivity_timeout_ms)
                    .map_or(d.inactivity_timeout, Duration::from_millis),
                mailbox_capacity: fp.mailbox_capacity.unwrap_or(d.mailbox_capacity).max(1),
            }
        };

        let call = CallConfig {
            announcement: env("SWITCHBOARD_ANNOUNCEMENT").or(fcall.announcement),
            greet: env("SWITCHBOARD_GREET")
                .map(|v| parse_bool(&v))
                .or(fcall.greet)
                .unwrap_or(true),
        };

        Ok(Self {
            server,
            recognition,
            completion,
            synthesis,
            playback,
            call,
        })
    }

    /// Check that every external collaborator needed to run calls is configured
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first missing setting
    pub fn validate(&self) -> Result<()> {
        if self.recognition.api_key.is_none() {
            return Err(Error::Config("DEEPGRAM_API_KEY is required".to_string()));
        }

        match self.completion.backend {
            CompletionBackend::External if self.completion.external_url.is_none() => {
                return Err(Error::Config(
                    "GPT_API_URL is required for the external completion backend".to_string(),
                ));
            }
            CompletionBackend::OpenAi if self.completion.api_key.is_none() => {
                return Err(Error::Config(
                    "OPENAI_API_KEY is required for the openai completion backend".to_string(),
                ));
            }
            _ => {}
        }

        if self.synthesis.api_key.is_none() {
            return Err(Error::Config("ELEVENLABS_API_KEY is required".to_string()));
        }
        if self.synthesis.voice_id.is_none() {
            return Err(Error::Config("ELEVENLABS_VOICE_ID is required".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_sources() {
        let config = Config::from_sources(SwitchboardConfigFile::default(), env_from(&[])).unwrap();

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.recognition.sample_rate, 8000);
        assert_eq!(config.recognition.encoding, "mulaw");
        assert_eq!(config.completion.pause_marker, '•');
        assert_eq!(config.completion.backend, CompletionBackend::External);
        assert_eq!(config.synthesis.output_format, "ulaw_8000");
        assert_eq!(config.playback.barge_in_cooldown, Duration::from_millis(1000));
        assert_eq!(config.playback.inactivity_timeout, Duration::from_secs(20));
        assert!(config.call.greet);
    }

    #[test]
    fn env_overrides_file() {
        let mut fc = SwitchboardConfigFile::default();
        fc.server.port = Some(8080);
        fc.playback.barge_in_cooldown_ms = Some(500);

        let config = Config::from_sources(
            fc,
            env_from(&[("PORT", "9090"), ("DEEPGRAM_API_KEY", "dg-key")]),
        )
        .unwrap();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.playback.barge_in_cooldown, Duration::from_millis(500));
        assert_eq!(
            config.recognition.api_key.as_ref().map(|k| k.expose_secret().to_string()),
            Some("dg-key".to_string())
        );
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let result = Config::from_sources(
            SwitchboardConfigFile::default(),
            env_from(&[("SWITCHBOARD_COMPLETION_BACKEND", "carrier-pigeon")]),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn validate_names_missing_keys() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("DEEPGRAM_API_KEY"));

        let config = Config::from_sources(
            SwitchboardConfigFile::default(),
            env_from(&[
                ("DEEPGRAM_API_KEY", "dg"),
                ("GPT_API_URL", "http://localhost:9000/chat"),
                ("ELEVENLABS_API_KEY", "el"),
                ("ELEVENLABS_VOICE_ID", "voice"),
            ]),
        )
        .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn openai_backend_requires_key() {
        let config = Config::from_sources(
            SwitchboardConfigFile::default(),
            env_from(&[
                ("DEEPGRAM_API_KEY", "dg"),
                ("SWITCHBOARD_COMPLETION_BACKEND", "openai"),
                ("ELEVENLABS_API_KEY", "el"),
                ("ELEVENLABS_VOICE_ID", "voice"),
            ]),
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }
}
