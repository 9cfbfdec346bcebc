//! Signalling codec for the conference-call control protocol.
//!
//! A single JSON schema covers every message exchanged with peer clients
//! (via the messaging backend) and with SFT servers (via HTTPS). Field names
//! are stable wire format; see `tests/wire_compat.rs`.

pub mod envelope;
pub mod error;
pub mod payloads;

pub use envelope::{Payload, SignalMessage};
pub use error::{Result, SignalError};
pub use payloads::{
    ConfCheck, ConfConn, ConfConnStatus, ConfKey, ConfPart, ConfStart, ConfStreams, KeyEntry,
    PartMember, Propsync, Setup, StreamInfo,
};

/// Encode a message to its JSON wire form.
pub fn encode(msg: &SignalMessage) -> Result<String> {
    Ok(serde_json::to_string(msg)?)
}

/// Decode a message from its JSON wire form.
pub fn decode(raw: &str) -> Result<SignalMessage> {
    Ok(serde_json::from_str(raw)?)
}
