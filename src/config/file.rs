//! TOML configuration file loading
//!
//! Supports `~/.config/switchboard/config.toml` as a persistent config source.
//! All fields are optional, the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct SwitchboardConfigFile {
    /// HTTP/WebSocket server configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Streaming speech recognition
    #[serde(default)]
    pub recognition: RecognitionFileConfig,

    /// Language model configuration
    #[serde(default)]
    pub completion: CompletionFileConfig,

    /// Speech synthesis configuration
    #[serde(default)]
    pub synthesis: SynthesisFileConfig,

    /// Playback sequencing and barge-in tuning
    #[serde(default)]
    pub playback: PlaybackFileConfig,

    /// Per-call behaviour
    #[serde(default)]
    pub call: CallFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub port: Option<u16>,
    /// Public hostname the telephony bridge connects back to
    pub public_host: Option<String>,
    pub requests_per_minute: Option<u32>,
}

/// Recognition configuration
#[derive(Debug, Default, Deserialize)]
pub struct RecognitionFileConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub language: Option<String>,
    pub encoding: Option<String>,
    pub sample_rate: Option<u32>,
    pub endpointing_ms: Option<u32>,
    pub utterance_end_ms: Option<u32>,
    pub keepalive_secs: Option<u64>,
}

/// Completion configuration
#[derive(Debug, Default, Deserialize)]
pub struct CompletionFileConfig {
    /// "external" or "openai"
    pub backend: Option<String>,
    pub external_url: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    pub pause_marker: Option<char>,
    pub fragment_target_chars: Option<usize>,
    pub interruption_target_chars: Option<usize>,
    pub pacing_ms: Option<u64>,
    pub interruption_pacing_ms: Option<u64>,
    pub fallback_text: Option<String>,
}

/// Synthesis configuration
#[derive(Debug, Default, Deserialize)]
pub struct SynthesisFileConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub voice_id: Option<String>,
    pub model_id: Option<String>,
    pub output_format: Option<String>,
    /// "streaming" or "buffered"
    pub mode: Option<String>,
    pub dedup_prefix_chars: Option<usize>,
    pub stability: Option<f32>,
    pub similarity_boost: Option<f32>,
}

/// Playback configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    pub barge_in_min_chars: Option<usize>,
    pub barge_in_cooldown_ms: Option<u64>,
    pub inactivity_timeout_ms: Option<u64>,
    pub mailbox_capacity: Option<usize>,
}

/// Call configuration
#[derive(Debug, Default, Deserialize)]
pub struct CallFileConfig {
    pub announcement: Option<String>,
    pub greet: Option<bool>,
}

/// Load the TOML config file from `SWITCHBOARD_CONFIG` or the standard path
///
/// Returns `SwitchboardConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> SwitchboardConfigFile {
    let path = std::env::var("SWITCHBOARD_CONFIG")
        .ok()
        .map(PathBuf::from)
        .or_else(config_file_path);

    let Some(path) = path else {
        return SwitchboardConfigFile::default();
    };

    load_config_file_from(&path)
}

/// Load a TOML config file from an explicit path
pub fn load_config_file_from(path: &Path) -> SwitchboardConfigFile {
    if !path.exists() {
        return SwitchboardConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                SwitchboardConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            SwitchboardConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/switchboard/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("switchboard").join("config.toml"))
}
