//! ## Signaling wire format
//!
//! Two peers that cannot reach each other directly exchange a handful of
//! small messages through a third party before a direct session exists:
//! an offer, an answer (or a decline), and any number of network path
//! candidates. The third party is either a message broker (the relay) or
//! an overlay network that addresses peers natively.
//!
//! Over the relay every message is a JSON object:
//!
//! ```text
//! { "type": 0|1|2|3, "from": "<identity>", "to": "<identity>", "data": "<opaque>" }
//! ```
//!
//! The relay only looks at `from` and `to`. The `data` field is a string
//! that only the negotiating peers interpret, as a session description
//! for offers and answers, or as a candidate.
//!
//! Over an overlay the addressing belongs to the overlay itself, so the
//! frame carries only `type` and `data`.

pub mod description;
pub mod handshake;
pub mod overlay;
pub mod route;
pub mod signal;

pub use self::{
    description::{IceCandidate, SdpType, SessionDescription},
    handshake::{Credentials, Rejection},
    overlay::OverlayFrame,
    route::Route,
    signal::{MessageType, SignalMessage},
};

#[derive(Debug)]
pub enum Error {
    /// The payload is not valid json, or does not match the expected shape.
    InvalidJson(serde_json::Error),
    /// A required field is absent.
    MissingField(&'static str),
    /// A field is present but has the wrong json type.
    InvalidField(&'static str),
    /// The message type is not one of the known values.
    UnknownType(u64),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson(e) => write!(f, "invalid json: {e}"),
            Self::MissingField(name) => write!(f, "missing '{name}' property"),
            Self::InvalidField(name) => write!(f, "invalid '{name}' property"),
            Self::UnknownType(kind) => write!(f, "unknown message type: {kind}"),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidJson(value)
    }
}
