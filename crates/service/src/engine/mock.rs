//! An engine that links sessions inside the process.
//!
//! Two connections created from clones of the same [`MockEngine`] can
//! negotiate with each other. Descriptions carry the connection id, so an
//! answer finds its offer through the shared network. Once both
//! descriptions are applied and each side has received at least one
//! candidate, the connection reports connected and every channel opens.
//!
//! Every connection gathers one candidate while its description is being
//! created, before it is committed, and one more right after the commit.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use bytes::Bytes;
use codec::{IceCandidate, SdpType, SessionDescription};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;

use super::{
    ChannelState, ConnectionObserver, ConnectionState, DataChannel, Engine, EngineError,
    PeerConnection, Reliability, SessionConfig,
};

type Observer = Weak<dyn ConnectionObserver<MockChannel>>;

/// An engine step that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    CreateConnection,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
}

struct Network {
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, Weak<ConnectionInner>>>,
    faults: Mutex<HashSet<Fault>>,
    manual_channels: AtomicBool,
    held: watch::Sender<bool>,
}

impl Network {
    fn check(&self, fault: Fault) -> Result<(), EngineError> {
        if self.faults.lock().contains(&fault) {
            Err(EngineError::Transport(format!("injected fault: {fault:?}")))
        } else {
            Ok(())
        }
    }

    fn lookup(&self, id: u64) -> Option<Arc<ConnectionInner>> {
        self.connections.lock().get(&id).and_then(Weak::upgrade)
    }
}

#[derive(Clone)]
pub struct MockEngine {
    network: Arc<Network>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            network: Arc::new(Network {
                next_id: AtomicU64::new(1),
                connections: Mutex::new(HashMap::new()),
                faults: Mutex::new(HashSet::new()),
                manual_channels: AtomicBool::new(false),
                held: watch::channel(false).0,
            }),
        }
    }

    /// Keep channels in `Connecting` after the connection is established.
    ///
    /// Channel states are then driven with
    /// [`MockConnection::emit_channel_state`].
    pub fn with_manual_channels(self) -> Self {
        self.network.manual_channels.store(true, Ordering::Relaxed);
        self
    }

    /// Make `set_local_description` wait until [`MockEngine::release_commits`].
    pub fn hold_commits(&self) {
        self.network.held.send_replace(true);
    }

    pub fn release_commits(&self) {
        self.network.held.send_replace(false);
    }

    pub fn inject(&self, fault: Fault) {
        self.network.faults.lock().insert(fault);
    }

    pub fn clear(&self, fault: Fault) {
        self.network.faults.lock().remove(&fault);
    }

    /// Number of connections that are still alive.
    pub fn live_connections(&self) -> usize {
        self.network
            .connections
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|it| !it.state.lock().closed)
            .count()
    }
}

impl Engine for MockEngine {
    type Connection = MockConnection;

    async fn create_connection(
        &self,
        _config: &SessionConfig,
        observer: Arc<dyn ConnectionObserver<MockChannel>>,
    ) -> Result<Self::Connection, EngineError> {
        self.network.check(Fault::CreateConnection)?;

        let id = self.network.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(ConnectionInner {
            observer: Arc::downgrade(&observer),
            network: self.network.clone(),
            state: Mutex::new(ConnectionTable::default()),
            id,
        });

        self.network
            .connections
            .lock()
            .insert(id, Arc::downgrade(&inner));

        Ok(MockConnection { inner })
    }
}

#[derive(Default)]
struct ConnectionTable {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    channels: Vec<MockChannel>,
    peer: Option<Weak<ConnectionInner>>,
    gathered: u16,
    remote_candidates: usize,
    connected: bool,
    closed: bool,
}

struct ConnectionInner {
    id: u64,
    observer: Observer,
    network: Arc<Network>,
    state: Mutex<ConnectionTable>,
}

impl ConnectionInner {
    /// Lock both tables, always in id order.
    fn lock_with<'a>(
        &'a self,
        other: &'a ConnectionInner,
    ) -> (MutexGuard<'a, ConnectionTable>, MutexGuard<'a, ConnectionTable>) {
        if self.id < other.id {
            let local = self.state.lock();
            (local, other.state.lock())
        } else {
            let remote = other.state.lock();
            (self.state.lock(), remote)
        }
    }

    fn observer(&self) -> Option<Arc<dyn ConnectionObserver<MockChannel>>> {
        self.observer.upgrade()
    }

    fn gather(&self) {
        let port = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }

            state.gathered += 1;
            50000 + state.gathered
        };

        if let Some(observer) = self.observer() {
            observer.on_ice_candidate(IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                    self.id, port
                ),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            });
        }
    }

    fn describe(&self, kind: SdpType) -> SessionDescription {
        let state = self.state.lock();
        let mut sdp = format!("v=0\r\no=mock {}\r\n", self.id);
        match kind {
            SdpType::Offer => {
                for channel in &state.channels {
                    sdp.push_str(&format!(
                        "a=channel:{} {}\r\n",
                        channel.label(),
                        match channel.inner.reliability {
                            Reliability::Reliable => "reliable",
                            Reliability::Unreliable => "unreliable",
                        }
                    ));
                }

                SessionDescription::offer(sdp)
            }
            SdpType::Answer => SessionDescription::answer(sdp),
        }
    }

    /// Pair the channels of an offering connection with a new set on the
    /// answering side and announce them there.
    fn link(self: &Arc<Self>, answerer: &Arc<ConnectionInner>) {
        let mut announced = Vec::new();
        {
            let (mut local, mut remote) = self.lock_with(answerer);

            for channel in &local.channels {
                let twin = MockChannel::new(
                    channel.label(),
                    channel.inner.reliability,
                    answerer.observer.clone(),
                );

                channel.pair(&twin);
                remote.channels.push(twin.clone());
                announced.push(twin);
            }

            local.peer = Some(Arc::downgrade(answerer));
            remote.peer = Some(Arc::downgrade(self));
        }

        if let Some(observer) = answerer.observer() {
            for channel in announced {
                observer.on_data_channel(channel);
            }
        }

        self.try_connect();
    }

    fn try_connect(self: &Arc<Self>) {
        let Some(peer) = self.state.lock().peer.as_ref().and_then(Weak::upgrade) else {
            return;
        };

        let channels = {
            let (mut local, mut remote) = self.lock_with(&peer);

            let ready = !local.closed
                && !remote.closed
                && !local.connected
                && local.remote_candidates > 0
                && remote.remote_candidates > 0;

            if !ready {
                return;
            }

            local.connected = true;
            remote.connected = true;
            local
                .channels
                .iter()
                .chain(remote.channels.iter())
                .cloned()
                .collect::<Vec<_>>()
        };

        for side in [self, &peer] {
            if let Some(observer) = side.observer() {
                observer.on_connection_state(ConnectionState::Connected);
            }
        }

        if !self.network.manual_channels.load(Ordering::Relaxed) {
            for channel in channels {
                channel.transition(ChannelState::Open);
            }
        }
    }
}

pub struct MockConnection {
    inner: Arc<ConnectionInner>,
}

impl MockConnection {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn channel(&self, label: &str) -> Option<MockChannel> {
        self.inner
            .state
            .lock()
            .channels
            .iter()
            .find(|it| it.label() == label)
            .cloned()
    }

    /// Report a channel state to this side only, as if the engine had.
    pub fn emit_channel_state(&self, label: &str, state: ChannelState) {
        if let Some(channel) = self.channel(label) {
            *channel.inner.state.lock() = state;
        }

        if let Some(observer) = self.inner.observer() {
            observer.on_channel_state(label, state);
        }
    }

    /// Report a connection state to this side only.
    pub fn emit_connection_state(&self, state: ConnectionState) {
        if let Some(observer) = self.inner.observer() {
            observer.on_connection_state(state);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    fn parse(description: &SessionDescription) -> Result<u64, EngineError> {
        description
            .sdp
            .lines()
            .find_map(|line| line.strip_prefix("o=mock "))
            .and_then(|id| id.trim().parse().ok())
            .ok_or_else(|| EngineError::InvalidDescription("missing origin".to_string()))
    }
}

impl PeerConnection for MockConnection {
    type Channel = MockChannel;

    async fn create_channel(
        &self,
        label: &str,
        reliability: Reliability,
    ) -> Result<MockChannel, EngineError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }

        if state.local.is_some() || state.remote.is_some() {
            return Err(EngineError::InvalidState("negotiation already started"));
        }

        let channel = MockChannel::new(label, reliability, self.inner.observer.clone());
        state.channels.push(channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.inner.network.check(Fault::CreateOffer)?;

        {
            let state = self.inner.state.lock();
            if state.closed {
                return Err(EngineError::Closed);
            }

            if state.remote.is_some() {
                return Err(EngineError::InvalidState("remote description already set"));
            }
        }

        self.inner.gather();
        Ok(self.inner.describe(SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.inner.network.check(Fault::CreateAnswer)?;

        {
            let state = self.inner.state.lock();
            if state.closed {
                return Err(EngineError::Closed);
            }

            if !matches!(&state.remote, Some(it) if it.kind == SdpType::Offer) {
                return Err(EngineError::InvalidState("no remote offer"));
            }
        }

        self.inner.gather();
        Ok(self.inner.describe(SdpType::Answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.inner.network.check(Fault::SetLocalDescription)?;

        let mut held = self.inner.network.held.subscribe();
        if held.wait_for(|it| !*it).await.is_err() {
            return Err(EngineError::Closed);
        }

        if Self::parse(&description)? != self.inner.id {
            return Err(EngineError::InvalidDescription("foreign description".to_string()));
        }

        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(EngineError::Closed);
            }

            if state.local.is_some() {
                return Err(EngineError::InvalidState("local description already set"));
            }

            state.local = Some(description);
        }

        self.inner.gather();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.inner.network.check(Fault::SetRemoteDescription)?;

        let remote = Self::parse(&description)?;
        let peer = self
            .inner
            .network
            .lookup(remote)
            .ok_or_else(|| EngineError::InvalidDescription(format!("unknown peer: {remote}")))?;

        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(EngineError::Closed);
            }

            if state.remote.is_some() {
                return Err(EngineError::InvalidState("remote description already set"));
            }

            match description.kind {
                SdpType::Offer if state.local.is_some() => {
                    return Err(EngineError::InvalidState("local offer already set"));
                }
                SdpType::Answer if state.local.is_none() => {
                    return Err(EngineError::InvalidState("no local offer"));
                }
                _ => (),
            }

            state.remote = Some(description.clone());
        }

        if description.kind == SdpType::Answer {
            self.inner.link(&peer);
        }

        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.inner.network.check(Fault::AddIceCandidate)?;

        if !candidate.candidate.starts_with("candidate:") {
            return Err(EngineError::Transport(format!(
                "malformed candidate: {}",
                candidate.candidate
            )));
        }

        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(EngineError::Closed);
            }

            if state.remote.is_none() {
                return Err(EngineError::InvalidState("no remote description"));
            }

            state.remote_candidates += 1;
        }

        self.inner.try_connect();
        Ok(())
    }

    async fn close(&self) {
        let (channels, peer) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }

            state.closed = true;
            state.connected = false;
            (
                std::mem::take(&mut state.channels),
                state.peer.as_ref().and_then(Weak::upgrade),
            )
        };

        for channel in channels {
            channel.transition(ChannelState::Closed);
        }

        if let Some(observer) = self.inner.observer() {
            observer.on_connection_state(ConnectionState::Closed);
        }

        if let Some(peer) = peer {
            peer.state.lock().connected = false;
            if let Some(observer) = peer.observer() {
                observer.on_connection_state(ConnectionState::Disconnected);
            }
        }

        self.inner.network.connections.lock().remove(&self.inner.id);
    }
}

struct ChannelInner {
    label: String,
    reliability: Reliability,
    state: Mutex<ChannelState>,
    observer: Observer,
    peer: Mutex<Option<Weak<ChannelInner>>>,
}

impl ChannelInner {
    fn set(&self, state: ChannelState) -> bool {
        let mut current = self.state.lock();
        if *current == state || *current == ChannelState::Closed {
            return false;
        }

        *current = state;
        true
    }

    fn notify(&self, state: ChannelState) {
        if let Some(observer) = self.observer.upgrade() {
            observer.on_channel_state(&self.label, state);
        }
    }
}

#[derive(Clone)]
pub struct MockChannel {
    inner: Arc<ChannelInner>,
}

impl MockChannel {
    fn new(label: &str, reliability: Reliability, observer: Observer) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                state: Mutex::new(ChannelState::Connecting),
                label: label.to_string(),
                peer: Mutex::new(None),
                reliability,
                observer,
            }),
        }
    }

    fn pair(&self, other: &MockChannel) {
        *self.inner.peer.lock() = Some(Arc::downgrade(&other.inner));
        *other.inner.peer.lock() = Some(Arc::downgrade(&self.inner));
    }

    fn peer(&self) -> Option<Arc<ChannelInner>> {
        self.inner.peer.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Move this end and its twin to `state`, notifying both sides.
    fn transition(&self, state: ChannelState) {
        for side in [Some(self.inner.clone()), self.peer()].into_iter().flatten() {
            if side.set(state) {
                side.notify(state);
            }
        }
    }

    pub fn reliability(&self) -> Reliability {
        self.inner.reliability
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }
}

impl DataChannel for MockChannel {
    fn label(&self) -> &str {
        &self.inner.label
    }

    async fn send(&self, data: Bytes) -> Result<(), EngineError> {
        if self.state() != ChannelState::Open {
            return Err(EngineError::InvalidState("channel not open"));
        }

        let peer = self.peer().ok_or(EngineError::Closed)?;
        if *peer.state.lock() != ChannelState::Open {
            return Err(EngineError::Closed);
        }

        if let Some(observer) = peer.observer.upgrade() {
            observer.on_message(&peer.label, data);
        }

        Ok(())
    }

    /// Closing one end closes its twin as well.
    async fn close(&self) {
        self.transition(ChannelState::Closed);
    }
}
