//! The peer-to-peer transport engine seen from the coordination layer.
//!
//! Path discovery, encryption and congestion control all live behind these
//! traits. A [`Session`](crate::session::Session) only drives an engine
//! through the negotiation steps and listens to what it reports back.

pub mod mock;

#[cfg(feature = "webrtc")]
pub mod webrtc;

use std::{future::Future, sync::Arc};

use bytes::Bytes;
use codec::{IceCandidate, SessionDescription};

/// Public STUN server used when nothing else is configured.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.stunprotocol.org";

/// Delivery guarantee of a channel, fixed when the channel is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reliability {
    /// Ordered, retransmitted until delivered.
    Reliable,
    /// Unordered, never retransmitted.
    Unreliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// What every session of a transport is created with.
///
/// Channel `i` of one peer is channel `i` of the other, so both ends must
/// use the same channel list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub ice_servers: Vec<String>,
    pub channels: Vec<Reliability>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            channels: vec![Reliability::Reliable, Reliability::Unreliable],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The connection or channel is already closed.
    Closed,
    /// The description could not be parsed or does not belong here.
    InvalidDescription(String),
    /// The call is not allowed in the current negotiation state.
    InvalidState(&'static str),
    /// Any other failure reported by the engine.
    Transport(String),
}

impl std::error::Error for EngineError {}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::InvalidDescription(e) => write!(f, "invalid description: {e}"),
            Self::InvalidState(e) => write!(f, "invalid state: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// Receives everything a connection reports asynchronously.
///
/// Channels are identified by their label.
#[allow(unused_variables)]
pub trait ConnectionObserver<C>: Send + Sync {
    /// A local candidate was gathered.
    fn on_ice_candidate(&self, candidate: IceCandidate) {}

    /// The remote peer opened a channel on this connection.
    fn on_data_channel(&self, channel: C) {}

    fn on_channel_state(&self, label: &str, state: ChannelState) {}

    fn on_message(&self, label: &str, data: Bytes) {}

    fn on_connection_state(&self, state: ConnectionState) {}
}

pub trait DataChannel: Clone + Send + Sync + 'static {
    fn label(&self) -> &str;

    fn send(&self, data: Bytes) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

pub trait PeerConnection: Send + Sync + 'static {
    type Channel: DataChannel;

    fn create_channel(
        &self,
        label: &str,
        reliability: Reliability,
    ) -> impl Future<Output = Result<Self::Channel, EngineError>> + Send;

    fn create_offer(&self) -> impl Future<Output = Result<SessionDescription, EngineError>> + Send;

    fn create_answer(&self) -> impl Future<Output = Result<SessionDescription, EngineError>> + Send;

    fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Channel handle type of an engine.
pub type Channel<E> = <<E as Engine>::Connection as PeerConnection>::Channel;

pub trait Engine: Send + Sync + 'static {
    type Connection: PeerConnection;

    /// Allocate a new peer connection.
    ///
    /// The engine must not keep the observer alive on its own, it belongs
    /// to the session and goes away with it.
    fn create_connection(
        &self,
        config: &SessionConfig,
        observer: Arc<dyn ConnectionObserver<Channel<Self>>>,
    ) -> impl Future<Output = Result<Self::Connection, EngineError>> + Send;
}
