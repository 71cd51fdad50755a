//! Error types for the switchboard gateway

use thiserror::Error;

/// Result type alias for switchboard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a call
///
/// Pipeline failures are contained inside the call session: they are logged
/// and degrade the conversation, they never tear down the session loop.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Speech recognition stream failed or closed
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Language model request failed
    #[error("completion error: {0}")]
    Completion(String),

    /// Speech synthesis failed for a fragment
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Malformed message from the telephony bridge
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket client error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
