use crate::engine::{
    Channel, ChannelState, ConnectionObserver, ConnectionState, DataChannel, Engine, EngineError,
    PeerConnection, SessionConfig,
};

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use codec::{IceCandidate, SdpType, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    oneshot,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, descriptions not exchanged yet.
    Idle,
    /// Both the local and the remote description are committed.
    DescriptionExchanged,
    /// At least one remote candidate has been applied.
    IceAccumulating,
    /// Every channel opened at least once.
    Connected,
    Failed,
    Closed,
}

/// The negotiation could not be carried out.
///
/// A session that returned this error is unusable and must be discarded.
#[derive(Debug)]
pub enum NegotiationError {
    Engine(EngineError),
    /// The remote description is not of the expected kind.
    InvalidDescription(SdpType),
    /// The call does not fit the current negotiation state.
    InvalidState(&'static str),
    Closed,
}

impl std::error::Error for NegotiationError {}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Engine(e) => write!(f, "engine error: {e}"),
            Self::InvalidDescription(kind) => write!(f, "unexpected description: {kind:?}"),
            Self::InvalidState(e) => write!(f, "invalid state: {e}"),
            Self::Closed => write!(f, "session closed"),
        }
    }
}

impl From<EngineError> for NegotiationError {
    fn from(value: EngineError) -> Self {
        Self::Engine(value)
    }
}

#[derive(Debug)]
pub enum SessionError {
    Closed,
    /// The channel index is out of range.
    InvalidChannel(usize),
    /// The channel exists but is not open.
    ChannelNotOpen(usize),
    /// Events can only be delivered to one handler.
    AlreadySubscribed,
    Engine(EngineError),
}

impl std::error::Error for SessionError {}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "session closed"),
            Self::InvalidChannel(index) => write!(f, "invalid channel: {index}"),
            Self::ChannelNotOpen(index) => write!(f, "channel not open: {index}"),
            Self::AlreadySubscribed => write!(f, "session already has a handler"),
            Self::Engine(e) => write!(f, "engine error: {e}"),
        }
    }
}

impl From<EngineError> for SessionError {
    fn from(value: EngineError) -> Self {
        Self::Engine(value)
    }
}

/// Session events, delivered in the order they happened.
#[allow(unused_variables)]
pub trait SessionHandler: Send + Sync + 'static {
    /// Every channel is open.
    fn on_connected(&self) {}

    /// At least one channel stopped being open after all of them were.
    fn on_disconnected(&self) {}

    fn on_message(&self, channel: usize, data: Bytes) {}

    /// The engine gave up on this session, or the remote announced a
    /// channel that does not exist here.
    fn on_failed(&self, reason: &str) {}
}

enum SessionEvent {
    Connected,
    Disconnected,
    Message(usize, Bytes),
    Failed(String),
}

struct Table<C> {
    state: SessionState,
    channels: Vec<Option<C>>,
    ready: Vec<ChannelState>,
    channels_open: bool,
    engine_connected: bool,
    local_description: Option<SessionDescription>,
    has_remote: bool,
}

impl<C> Table<C> {
    fn is_terminal(&self) -> bool {
        matches!(self.state, SessionState::Closed | SessionState::Failed)
    }
}

/// The part of a session the engine reports into.
struct Core<C> {
    id: u64,
    closed: AtomicBool,
    table: Mutex<Table<C>>,
    events: Mutex<Option<UnboundedSender<SessionEvent>>>,
    receiver: Mutex<Option<UnboundedReceiver<SessionEvent>>>,
    candidates: Mutex<Option<UnboundedSender<IceCandidate>>>,
    commit: Mutex<Option<oneshot::Sender<()>>>,
}

impl<C: DataChannel> Core<C> {
    /// Channels are labelled with their decimal index.
    fn index(&self, label: &str) -> Option<usize> {
        let index = label.parse::<usize>().ok()?;
        (index < self.table.lock().ready.len()).then_some(index)
    }

    /// Events are queued while the table lock is held, so their order is
    /// the order of the transitions that raised them.
    fn emit(&self, event: SessionEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    fn fail(&self, reason: String) {
        let mut table = self.table.lock();
        if table.is_terminal() {
            return;
        }

        log::error!("session failed: id={}, reason={}", self.id, reason);

        table.state = SessionState::Failed;
        self.emit(SessionEvent::Failed(reason));
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<C: DataChannel> ConnectionObserver<C> for Core<C> {
    fn on_ice_candidate(&self, candidate: IceCandidate) {
        if self.is_closed() {
            return;
        }

        if let Some(candidates) = self.candidates.lock().as_ref() {
            let _ = candidates.send(candidate);
        }
    }

    fn on_data_channel(&self, channel: C) {
        if self.is_closed() {
            return;
        }

        let Some(index) = self.index(channel.label()) else {
            self.fail(format!("unexpected channel label: {}", channel.label()));
            return;
        };

        self.table.lock().channels[index] = Some(channel);
    }

    fn on_channel_state(&self, label: &str, state: ChannelState) {
        if self.is_closed() {
            return;
        }

        let Some(index) = self.index(label) else {
            log::warn!("state of unknown channel: id={}, label={}", self.id, label);
            return;
        };

        let mut table = self.table.lock();
        if table.state == SessionState::Closed {
            return;
        }

        table.ready[index] = state;

        let open = table.ready.iter().all(|it| *it == ChannelState::Open);
        if open == table.channels_open {
            return;
        }

        table.channels_open = open;
        if open {
            if !table.is_terminal() {
                table.state = SessionState::Connected;
            }

            log::info!("session channels open: id={}", self.id);
            self.emit(SessionEvent::Connected);
        } else {
            log::info!(
                "session channel closed: id={}, channel={}, state={:?}",
                self.id,
                index,
                state
            );

            self.emit(SessionEvent::Disconnected);
        }
    }

    fn on_message(&self, label: &str, data: Bytes) {
        if self.is_closed() {
            return;
        }

        if let Some(index) = self.index(label) {
            let _table = self.table.lock();
            self.emit(SessionEvent::Message(index, data));
        }
    }

    fn on_connection_state(&self, state: ConnectionState) {
        if self.is_closed() {
            return;
        }

        log::debug!("session connection state: id={}, state={:?}", self.id, state);

        self.table.lock().engine_connected = state == ConnectionState::Connected;
        if state == ConnectionState::Failed {
            self.fail("connection failed".to_string());
        }
    }
}

struct Inner<E: Engine> {
    connection: E::Connection,
    core: Arc<Core<Channel<E>>>,
    offerer: bool,
}

/// One negotiated transport session and its fixed set of channels.
///
/// Sessions are cheap handles, clones refer to the same session. The engine
/// resources are only released by [`Session::close`].
pub struct Session<E: Engine> {
    inner: Arc<Inner<E>>,
}

impl<E: Engine> Clone for Session<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Engine> Session<E> {
    /// Create the offering side of a session.
    ///
    /// All channels are created before the offer, labelled with their
    /// index. `on_local_candidate` receives the local candidates in the
    /// order they were gathered, but never before the offer is committed.
    pub async fn create_offer<F>(
        engine: &E,
        config: &SessionConfig,
        on_local_candidate: F,
    ) -> Result<Self, NegotiationError>
    where
        F: Fn(IceCandidate) + Send + Sync + 'static,
    {
        let session = Self::allocate(engine, config, true, on_local_candidate).await?;
        let result = async {
            for (index, reliability) in config.channels.iter().enumerate() {
                let channel = session
                    .inner
                    .connection
                    .create_channel(&index.to_string(), *reliability)
                    .await?;

                session.inner.core.table.lock().channels[index] = Some(channel);
            }

            let offer = session.inner.connection.create_offer().await?;
            session.commit(offer).await
        }
        .await;

        session.settle(result).await
    }

    /// Create the answering side of a session from a remote offer.
    ///
    /// Channels are announced by the remote. A label that is not the index
    /// of a configured channel makes the session fail.
    pub async fn create_answer<F>(
        engine: &E,
        config: &SessionConfig,
        on_local_candidate: F,
        remote: SessionDescription,
    ) -> Result<Self, NegotiationError>
    where
        F: Fn(IceCandidate) + Send + Sync + 'static,
    {
        if remote.kind != SdpType::Offer {
            return Err(NegotiationError::InvalidDescription(remote.kind));
        }

        let session = Self::allocate(engine, config, false, on_local_candidate).await?;
        let result = async {
            session.inner.core.table.lock().has_remote = true;
            session.inner.connection.set_remote_description(remote).await?;

            let answer = session.inner.connection.create_answer().await?;
            session.commit(answer).await?;

            session.inner.core.table.lock().state = SessionState::DescriptionExchanged;
            Ok::<_, NegotiationError>(())
        }
        .await;

        session.settle(result).await
    }

    async fn allocate<F>(
        engine: &E,
        config: &SessionConfig,
        offerer: bool,
        on_local_candidate: F,
    ) -> Result<Self, NegotiationError>
    where
        F: Fn(IceCandidate) + Send + Sync + 'static,
    {
        if config.channels.is_empty() {
            return Err(NegotiationError::InvalidState("no channels configured"));
        }

        let (events, receiver) = unbounded_channel();
        let (candidates, mut pending) = unbounded_channel();
        let (commit, committed) = oneshot::channel();

        let core = Arc::new(Core {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
            table: Mutex::new(Table {
                state: SessionState::Idle,
                channels: config.channels.iter().map(|_| None).collect(),
                ready: vec![ChannelState::Connecting; config.channels.len()],
                channels_open: false,
                engine_connected: false,
                local_description: None,
                has_remote: false,
            }),
            events: Mutex::new(Some(events)),
            receiver: Mutex::new(Some(receiver)),
            candidates: Mutex::new(Some(candidates)),
            commit: Mutex::new(Some(commit)),
        });

        let connection = engine.create_connection(config, core.clone()).await?;

        // Candidates gathered before the local description is committed wait
        // here, in order. Dropping the commit sender cancels the forwarding.
        tokio::spawn(async move {
            if committed.await.is_err() {
                return;
            }

            while let Some(candidate) = pending.recv().await {
                on_local_candidate(candidate);
            }
        });

        log::info!(
            "session created: id={}, offerer={}, channels={}",
            core.id,
            offerer,
            config.channels.len()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                connection,
                offerer,
                core,
            }),
        })
    }

    async fn commit(&self, description: SessionDescription) -> Result<(), NegotiationError> {
        if self.inner.core.is_closed() {
            return Err(NegotiationError::Closed);
        }

        self.inner
            .connection
            .set_local_description(description.clone())
            .await?;

        self.inner.core.table.lock().local_description = Some(description);
        if let Some(commit) = self.inner.core.commit.lock().take() {
            let _ = commit.send(());
        }

        Ok(())
    }

    /// Keep the session on success, release it on failure.
    async fn settle(self, result: Result<(), NegotiationError>) -> Result<Self, NegotiationError> {
        match result {
            Ok(()) if self.inner.core.is_closed() => Err(NegotiationError::Closed),
            Ok(()) => Ok(self),
            Err(e) => {
                log::error!("session negotiation failed: id={}, error={}", self.id(), e);

                self.close().await;
                Err(e)
            }
        }
    }

    /// Commit the answer to an offer created by this session.
    ///
    /// Only allowed once, on the offering side. An engine error here leaves
    /// the session failed.
    pub async fn apply_answer(&self, remote: SessionDescription) -> Result<(), NegotiationError> {
        if !self.inner.offerer {
            return Err(NegotiationError::InvalidState("not the offering side"));
        }

        if remote.kind != SdpType::Answer {
            return Err(NegotiationError::InvalidDescription(remote.kind));
        }

        {
            let mut table = self.inner.core.table.lock();
            if table.state == SessionState::Closed {
                return Err(NegotiationError::Closed);
            }

            if table.has_remote {
                return Err(NegotiationError::InvalidState("remote description already set"));
            }

            if table.local_description.is_none() {
                return Err(NegotiationError::InvalidState("offer not committed"));
            }

            table.has_remote = true;
        }

        if let Err(e) = self.inner.connection.set_remote_description(remote).await {
            self.inner.core.fail(format!("apply answer: {e}"));
            return Err(e.into());
        }

        let mut table = self.inner.core.table.lock();
        if table.state == SessionState::Idle {
            table.state = SessionState::DescriptionExchanged;
        }

        Ok(())
    }

    /// Apply a remote candidate.
    ///
    /// A rejected candidate is logged and forgotten, the peers exchange
    /// more than they need. Nothing happens on a closed session.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) {
        if self.inner.core.is_closed() {
            return;
        }

        if let Err(e) = self.inner.connection.add_ice_candidate(candidate).await {
            log::warn!("ice candidate rejected: id={}, error={}", self.id(), e);
            return;
        }

        let mut table = self.inner.core.table.lock();
        if table.state == SessionState::DescriptionExchanged {
            table.state = SessionState::IceAccumulating;
        }
    }

    /// Send on an open channel. Nothing is queued.
    pub async fn send(&self, channel: usize, data: Bytes) -> Result<(), SessionError> {
        let handle = {
            let table = self.inner.core.table.lock();
            if table.state == SessionState::Closed {
                return Err(SessionError::Closed);
            }

            if channel >= table.ready.len() {
                return Err(SessionError::InvalidChannel(channel));
            }

            match (&table.channels[channel], table.ready[channel]) {
                (Some(handle), ChannelState::Open) => handle.clone(),
                _ => return Err(SessionError::ChannelNotOpen(channel)),
            }
        };

        Ok(handle.send(data).await?)
    }

    /// Close every channel, then the connection.
    ///
    /// Closing twice is a no-op. If the channels were open, the final
    /// disconnected event is raised here, anything the engine reports
    /// afterwards is ignored.
    pub async fn close(&self) {
        let core = &self.inner.core;
        if core.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let channels = {
            let mut table = core.table.lock();
            table.state = SessionState::Closed;
            if table.channels_open {
                table.channels_open = false;
                core.emit(SessionEvent::Disconnected);
            }

            table.ready.fill(ChannelState::Closed);
            table.channels.iter_mut().filter_map(Option::take).collect::<Vec<_>>()
        };

        core.events.lock().take();
        core.candidates.lock().take();
        core.commit.lock().take();

        for channel in channels {
            channel.close().await;
        }

        self.inner.connection.close().await;

        log::info!("session closed: id={}", self.id());
    }

    /// Attach the handler that receives this session's events.
    ///
    /// Events raised before this call are delivered first, in order.
    pub fn subscribe<H: SessionHandler>(&self, handler: H) -> Result<(), SessionError> {
        let mut receiver = self
            .inner
            .core
            .receiver
            .lock()
            .take()
            .ok_or(SessionError::AlreadySubscribed)?;

        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                match event {
                    SessionEvent::Connected => handler.on_connected(),
                    SessionEvent::Disconnected => handler.on_disconnected(),
                    SessionEvent::Message(channel, data) => handler.on_message(channel, data),
                    SessionEvent::Failed(reason) => handler.on_failed(&reason),
                }
            }
        });

        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.inner.core.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.core.table.lock().state
    }

    pub fn is_offerer(&self) -> bool {
        self.inner.offerer
    }

    pub fn channel_count(&self) -> usize {
        self.inner.core.table.lock().ready.len()
    }

    pub fn channel_state(&self, channel: usize) -> Option<ChannelState> {
        self.inner.core.table.lock().ready.get(channel).copied()
    }

    /// Every channel reports open.
    pub fn channels_open(&self) -> bool {
        self.inner.core.table.lock().channels_open
    }

    /// Every channel is open and the engine reports the connection up.
    pub fn is_connected(&self) -> bool {
        let table = self.inner.core.table.lock();
        table.channels_open && table.engine_connected
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.inner.core.table.lock().local_description.clone()
    }

    pub fn connection(&self) -> &E::Connection {
        &self.inner.connection
    }
}

impl<E: Engine> fmt::Display for Session<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.inner.core.table.lock();
        write!(f, "Session #{} ({:?})", self.inner.core.id, table.state)?;
        for (index, state) in table.ready.iter().enumerate() {
            write!(f, "\n- {index}: {state:?}")?;
        }

        Ok(())
    }
}

impl<E: Engine> fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("offerer", &self.is_offerer())
            .finish()
    }
}
