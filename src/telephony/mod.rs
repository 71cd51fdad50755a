//! Telephony bridge boundary
//!
//! Wire events exchanged with the media bridge and the TwiML answer that
//! points an inbound call at the media stream endpoint.

pub mod protocol;
pub mod twiml;

pub use protocol::{BridgeEvent, MarkPayload, MediaPayload, OutboundEvent, StartMeta};
