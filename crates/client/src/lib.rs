//! Signaling transports.
//!
//! [`RelayClient`] reaches peers by identity through the WebSocket relay,
//! [`OverlaySocket`] reaches them directly by socket address. Both carry
//! the same four messages and plug into a
//! [`Signaler`](service::Signaler) unchanged.

pub mod overlay;
pub mod relay;

use std::fmt;

use codec::Rejection;
use tokio_tungstenite::tungstenite;

pub use self::{
    overlay::OverlaySocket,
    relay::{RelayClient, RelayClientBuilder},
};

#[derive(Debug)]
pub enum Error {
    WebSocket(tungstenite::Error),
    /// A handshake value cannot be sent as an http header.
    InvalidHeader(&'static str),
    /// The relay refused the connection.
    Rejected(Rejection),
    Codec(codec::Error),
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket(e) => write!(f, "websocket error: {e}"),
            Self::InvalidHeader(name) => write!(f, "invalid header value: {name}"),
            Self::Rejected(e) => write!(f, "rejected by relay: {e}"),
            Self::Codec(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl From<tungstenite::Error> for Error {
    fn from(value: tungstenite::Error) -> Self {
        Self::WebSocket(value)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}
