//! Media stream wire protocol spoken by the telephony bridge
//!
//! The bridge sends JSON text frames tagged by an `event` field. Inbound frames
//! carry caller audio and playback acknowledgments; outbound frames carry reply
//! audio, correlation marks and the clear command used for barge-in.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Event received from the telephony bridge
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum BridgeEvent {
    /// Socket handshake, carries nothing the session needs
    Connected,
    /// Call started streaming
    Start { start: StartMeta },
    /// One frame of caller audio
    Media { media: MediaPayload },
    /// Playback acknowledgment for a mark sent earlier
    Mark { mark: MarkPayload },
    /// Call ended
    Stop,
}

impl BridgeEvent {
    /// Parse one text frame from the bridge
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the frame is not a known bridge event
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Protocol(e.to_string()))
    }
}

/// Metadata carried by the `start` event
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMeta {
    pub stream_sid: String,
    pub call_sid: String,
    /// Free-form parameters attached when the stream was connected
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

/// Base64 encoded narrow-band audio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
}

/// Mark correlation label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

/// Command sent to the telephony bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundEvent {
    /// Reply audio to play to the caller
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: MediaPayload,
    },
    /// Ask the bridge to acknowledge once playback reaches this point
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkPayload,
    },
    /// Drop all audio queued for playback
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

impl OutboundEvent {
    /// Build a media command
    #[must_use]
    pub fn media(stream_sid: &str, payload: String) -> Self {
        Self::Media {
            stream_sid: stream_sid.to_string(),
            media: MediaPayload { payload },
        }
    }

    /// Build a mark command
    #[must_use]
    pub fn mark(stream_sid: &str, name: String) -> Self {
        Self::Mark {
            stream_sid: stream_sid.to_string(),
            mark: MarkPayload { name },
        }
    }

    /// Build a clear command
    #[must_use]
    pub fn clear(stream_sid: &str) -> Self {
        Self::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }

    /// Serialize to a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
