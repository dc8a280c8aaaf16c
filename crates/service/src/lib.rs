//! Turns an exchange of signaling messages into live multi-channel
//! sessions.
//!
//! A [`Signaler`](signaler::Signaler) receives offers, answers and
//! candidates from a [`SignalingTransport`](signaler::SignalingTransport),
//! drives [`Session`](session::Session)s through the negotiation, and hands
//! them to the [`TransportRegistry`](registry::TransportRegistry), which
//! reports them to the application as connected clients.

pub mod engine;
pub mod registry;
pub mod session;
pub mod signaler;

pub use self::{
    engine::{Reliability, SessionConfig},
    registry::{
        ConnectionId, MAX_PACKET_SIZE, PeerAddress, RegistryError, RegistryOptions,
        TransportHandler, TransportRegistry,
    },
    session::{NegotiationError, Session, SessionError, SessionHandler, SessionState},
    signaler::{Envelope, SignalerError, Signaler, SignalingTransport, TransportError},
};
