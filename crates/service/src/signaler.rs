use crate::{
    engine::Engine,
    registry::{PeerAddress, RegistryError, TransportHandler, TransportRegistry},
    session::{NegotiationError, Session},
};

use std::{fmt, future::Future, sync::Arc};

use codec::{IceCandidate, MessageType, SessionDescription};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

/// Reason sent back when an offer reaches a peer that does not serve.
pub const SERVER_NOT_ACTIVE: &str = "Server not active";

#[derive(Debug)]
pub enum TransportError {
    /// The transport is gone, nothing can be sent or received anymore.
    Closed,
    /// An inbound message could not be decoded.
    Codec(codec::Error),
    Io(std::io::Error),
}

impl std::error::Error for TransportError {}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Codec(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl From<codec::Error> for TransportError {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// A message received from a signaling transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<A> {
    pub kind: MessageType,
    pub from: A,
    pub data: String,
}

/// Anything that can carry the four signaling messages between peers.
///
/// The relay client and the overlay socket are both thin implementations of
/// this, the negotiation itself never depends on which one is used.
pub trait SignalingTransport: Send + Sync + 'static {
    type Address: PeerAddress;

    /// The address other peers reach us under, if we have one yet.
    fn local_address(&self) -> Option<Self::Address>;

    fn send(
        &self,
        to: &Self::Address,
        kind: MessageType,
        data: String,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next inbound message, `None` once the transport is closed.
    ///
    /// A message that could not be decoded is returned as an error, the
    /// transport stays usable.
    fn recv(
        &self,
    ) -> impl Future<Output = Option<Result<Envelope<Self::Address>, TransportError>>> + Send;
}

#[derive(Debug)]
pub enum SignalerError {
    /// The transport has no local address, we are not reachable.
    NotRegistered,
    InvalidAddress(String),
    SelfAddressed,
    /// The offer was canceled while it was being prepared.
    Canceled,
    /// An answer arrived without an offer of ours.
    NoClientSession,
    /// A candidate came from a peer we are not negotiating with.
    UnknownPeer(String),
    Codec(codec::Error),
    Negotiation(NegotiationError),
    Registry(RegistryError),
    Transport(TransportError),
}

impl std::error::Error for SignalerError {}

impl fmt::Display for SignalerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRegistered => write!(f, "not registered on the signaling transport"),
            Self::InvalidAddress(it) => write!(f, "invalid recipient: '{it}'"),
            Self::SelfAddressed => write!(f, "recipient is ourselves"),
            Self::Canceled => write!(f, "offer canceled"),
            Self::NoClientSession => write!(f, "no client session"),
            Self::UnknownPeer(it) => write!(f, "unknown peer: {it}"),
            Self::Codec(e) => write!(f, "malformed payload: {e}"),
            Self::Negotiation(e) => write!(f, "negotiation failed: {e}"),
            Self::Registry(e) => write!(f, "{e}"),
            Self::Transport(e) => write!(f, "{e}"),
        }
    }
}

impl From<codec::Error> for SignalerError {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

impl From<NegotiationError> for SignalerError {
    fn from(value: NegotiationError) -> Self {
        Self::Negotiation(value)
    }
}

impl From<RegistryError> for SignalerError {
    fn from(value: RegistryError) -> Self {
        Self::Registry(value)
    }
}

impl From<TransportError> for SignalerError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

/// The negotiation state machine of one transport.
///
/// Creates sessions for outgoing offers and incoming offers, and feeds
/// answers and candidates to the sessions they belong to.
pub struct Signaler<T: SignalingTransport, E: Engine, H> {
    transport: Arc<T>,
    registry: Arc<TransportRegistry<E, H, T::Address>>,
}

impl<T: SignalingTransport, E: Engine, H> Clone for Signaler<T, E, H> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<T, E, H> Signaler<T, E, H>
where
    T: SignalingTransport,
    E: Engine,
    H: TransportHandler,
{
    pub fn new(transport: Arc<T>, registry: Arc<TransportRegistry<E, H, T::Address>>) -> Self {
        Self {
            transport,
            registry,
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<TransportRegistry<E, H, T::Address>> {
        &self.registry
    }

    /// Connect to a remote peer as a client.
    ///
    /// The session is the registry's client session before the offer goes
    /// out, so the answer always finds it.
    pub async fn offer(&self, remote: T::Address) -> Result<(), SignalerError> {
        let local = self.transport.local_address().ok_or_else(|| {
            log::error!("offer rejected: not registered");
            SignalerError::NotRegistered
        })?;

        if remote.is_unspecified() {
            log::error!("offer rejected: invalid recipient='{}'", remote);
            return Err(SignalerError::InvalidAddress(remote.to_string()));
        }

        if remote.is_local(&local) {
            log::error!("offer rejected: recipient is ourselves");
            return Err(SignalerError::SelfAddressed);
        }

        let attempt = self.registry.begin_client()?;

        log::info!("creating offer: to={}", remote);

        let (candidates, pending) = unbounded_channel();
        let session = match Session::create_offer(
            self.registry.engine(),
            self.registry.session_config(),
            move |candidate| {
                let _ = candidates.send(candidate);
            },
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                self.registry.abort_client(attempt);
                return Err(e.into());
            }
        };

        if !self.registry.attach_client(attempt, &session) {
            log::warn!("offer canceled: to={}", remote);

            session.close().await;
            return Err(SignalerError::Canceled);
        }

        if let Err(e) = self.send_description(&remote, MessageType::Offer, &session).await {
            let _ = self.registry.client_disconnect().await;
            return Err(e);
        }

        self.forward_candidates(remote, pending);
        Ok(())
    }

    /// Handle inbound messages until the transport closes.
    ///
    /// Messages are handled one at a time in arrival order. Nothing a peer
    /// sends can stop this loop.
    pub async fn run(&self) {
        while let Some(message) = self.transport.recv().await {
            let envelope = match message {
                Ok(envelope) => envelope,
                Err(e) => {
                    log::warn!("signaling message dropped: {}", e);
                    continue;
                }
            };

            let (kind, from) = (envelope.kind, envelope.from.clone());
            if let Err(e) = self.handle(envelope).await {
                log::error!("signaling message failed: type={}, from={}, error={}", kind, from, e);
            }
        }

        log::info!("signaling transport closed");
    }

    pub async fn handle(&self, envelope: Envelope<T::Address>) -> Result<(), SignalerError> {
        log::debug!("signaling message: type={}, from={}", envelope.kind, envelope.from);

        match envelope.kind {
            MessageType::Offer => self.on_offer(envelope.from, &envelope.data).await,
            MessageType::Answer => self.on_answer(&envelope.data).await,
            MessageType::Decline => {
                self.registry.decline_client(&envelope.data).await;
                Ok(())
            }
            MessageType::IceCandidate => self.on_candidate(&envelope.from, &envelope.data).await,
        }
    }

    async fn on_offer(&self, from: T::Address, data: &str) -> Result<(), SignalerError> {
        if !self.registry.server_active() {
            log::warn!("offer declined: server not active, from={}", from);

            self.transport
                .send(&from, MessageType::Decline, SERVER_NOT_ACTIVE.to_string())
                .await?;

            return Ok(());
        }

        let description = SessionDescription::from_json(data)?;

        log::info!("creating answer: to={}", from);

        let (candidates, pending) = unbounded_channel();
        let session = Session::create_answer(
            self.registry.engine(),
            self.registry.session_config(),
            move |candidate| {
                let _ = candidates.send(candidate);
            },
            description,
        )
        .await?;

        let id = match self.registry.accept_server_session(from.clone(), &session) {
            Ok(id) => id,
            Err(e) => {
                session.close().await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.send_description(&from, MessageType::Answer, &session).await {
            let _ = self.registry.server_disconnect(id).await;
            return Err(e);
        }

        self.forward_candidates(from, pending);
        Ok(())
    }

    async fn on_answer(&self, data: &str) -> Result<(), SignalerError> {
        let session = self
            .registry
            .client_session()
            .ok_or(SignalerError::NoClientSession)?;

        let description = SessionDescription::from_json(data)?;
        session.apply_answer(description).await?;

        log::info!("answer applied: session={}", session.id());
        Ok(())
    }

    async fn on_candidate(&self, from: &T::Address, data: &str) -> Result<(), SignalerError> {
        let candidate = IceCandidate::from_json(data)?;
        let session = self
            .registry
            .client_session()
            .or_else(|| self.registry.resolve_peer(from))
            .ok_or_else(|| SignalerError::UnknownPeer(from.to_string()))?;

        session.add_ice_candidate(candidate).await;
        Ok(())
    }

    async fn send_description(
        &self,
        to: &T::Address,
        kind: MessageType,
        session: &Session<E>,
    ) -> Result<(), SignalerError> {
        let description = session
            .local_description()
            .ok_or(SignalerError::Negotiation(NegotiationError::InvalidState(
                "no local description",
            )))?;

        self.transport.send(to, kind, description.to_json()?).await?;

        log::info!("{} sent: to={}, session={}", kind, to, session.id());
        Ok(())
    }

    /// Relay the local candidates of a session, starting now.
    ///
    /// Called only after the description went out, so a peer never sees a
    /// candidate before the offer or answer it belongs to. Stops once the
    /// session is closed.
    fn forward_candidates(&self, to: T::Address, mut pending: UnboundedReceiver<IceCandidate>) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            while let Some(candidate) = pending.recv().await {
                let data = match candidate.to_json() {
                    Ok(data) => data,
                    Err(e) => {
                        log::warn!("ice candidate dropped: {}", e);
                        continue;
                    }
                };

                if let Err(e) = transport.send(&to, MessageType::IceCandidate, data).await {
                    log::warn!("ice candidate not sent: to={}, error={}", to, e);
                }
            }
        });
    }
}
