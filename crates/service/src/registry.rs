use crate::{
    engine::{Engine, SessionConfig},
    session::{Session, SessionError, SessionHandler},
};

use std::{
    fmt,
    hash::Hash,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use ahash::{HashMap, HashMapExt};
use bytes::Bytes;
use parking_lot::Mutex;

/// Largest payload an application should hand to a single send.
pub const MAX_PACKET_SIZE: usize = 1200;

/// Identifies one remote client while the server role is active.
///
/// Ids start at 1 every time the server is started.
pub type ConnectionId = u32;

/// Application events of a transport.
///
/// All methods have empty default implementations.
#[allow(unused_variables)]
pub trait TransportHandler: Send + Sync + 'static {
    /// The client session opened all its channels.
    fn on_client_connected(&self) {}

    fn on_client_disconnected(&self) {}

    /// The remote refused the offer.
    fn on_client_declined(&self, reason: &str) {}

    fn on_client_data(&self, channel: usize, data: Bytes) {}

    fn on_server_started(&self) {}

    fn on_server_stopped(&self) {}

    fn on_server_connected(&self, id: ConnectionId) {}

    fn on_server_disconnected(&self, id: ConnectionId) {}

    fn on_server_data(&self, id: ConnectionId, channel: usize, data: Bytes) {}
}

/// Addresses peers can be reached under through a signaling transport.
pub trait PeerAddress: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {
    /// An address nobody can be reached under.
    fn is_unspecified(&self) -> bool;

    /// Whether this address reaches the transport bound at `local`.
    fn is_local(&self, local: &Self) -> bool {
        self == local
    }
}

impl PeerAddress for String {
    fn is_unspecified(&self) -> bool {
        self.trim().is_empty()
    }
}

impl PeerAddress for std::net::SocketAddr {
    fn is_unspecified(&self) -> bool {
        self.ip().is_unspecified() || self.port() == 0
    }

    /// A socket bound to the wildcard address is also reached through
    /// loopback on its port.
    fn is_local(&self, local: &Self) -> bool {
        self == local
            || (local.ip().is_unspecified() && self.ip().is_loopback() && self.port() == local.port())
    }
}

#[derive(Debug)]
pub enum RegistryError {
    /// A transport needs at least one channel.
    NoChannels,
    ServerActive,
    ServerInactive,
    /// A client session exists or is being negotiated.
    ClientActive,
    ClientInactive,
    UnknownConnection(ConnectionId),
    /// The peer already has a connection on this server.
    DuplicatePeer(String),
    Session(SessionError),
}

impl std::error::Error for RegistryError {}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoChannels => write!(f, "at least one channel is required"),
            Self::ServerActive => write!(f, "server already started"),
            Self::ServerInactive => write!(f, "server not active"),
            Self::ClientActive => write!(f, "transport already running as client"),
            Self::ClientInactive => write!(f, "client not connected"),
            Self::UnknownConnection(id) => write!(f, "unknown connection: {id}"),
            Self::DuplicatePeer(peer) => write!(f, "peer already connected: {peer}"),
            Self::Session(e) => write!(f, "session error: {e}"),
        }
    }
}

impl From<SessionError> for RegistryError {
    fn from(value: SessionError) -> Self {
        Self::Session(value)
    }
}

pub struct ConnectionRecord<E: Engine, A> {
    pub id: ConnectionId,
    pub session: Session<E>,
    pub peer: A,
}

/// Live connections of one server run.
///
/// `connections` and `peers` always describe the same set of records, both
/// are only ever changed together under the server lock.
struct ServerTable<E: Engine, A> {
    epoch: u64,
    next_id: ConnectionId,
    connections: HashMap<ConnectionId, ConnectionRecord<E, A>>,
    peers: HashMap<A, ConnectionId>,
}

impl<E: Engine, A: PeerAddress> ServerTable<E, A> {
    fn remove(&mut self, id: ConnectionId) -> Option<ConnectionRecord<E, A>> {
        let record = self.connections.remove(&id)?;
        self.peers.remove(&record.peer);
        Some(record)
    }
}

enum ServerRole<E: Engine, A> {
    Inactive,
    Active(ServerTable<E, A>),
}

enum ClientSlot<E: Engine> {
    Idle,
    /// An offer is being prepared, the session does not exist yet.
    Negotiating(u64),
    Active(Session<E>),
}

pub struct RegistryOptions<E, H> {
    pub session: SessionConfig,
    pub engine: E,
    pub handler: H,
}

/// Owns every live session of a transport.
///
/// A transport is either a client with at most one session, or a server
/// with one session per remote peer, never both at once. Locks are always
/// taken client first, and never held across an await.
pub struct TransportRegistry<E: Engine, H, A> {
    config: SessionConfig,
    engine: E,
    handler: H,
    epochs: AtomicU64,
    attempts: AtomicU64,
    server: Mutex<ServerRole<E, A>>,
    client: Mutex<ClientSlot<E>>,
}

impl<E, H, A> TransportRegistry<E, H, A>
where
    E: Engine,
    H: TransportHandler,
    A: PeerAddress,
{
    pub fn new(options: RegistryOptions<E, H>) -> Result<Arc<Self>, RegistryError> {
        if options.session.channels.is_empty() {
            return Err(RegistryError::NoChannels);
        }

        Ok(Arc::new(Self {
            server: Mutex::new(ServerRole::Inactive),
            client: Mutex::new(ClientSlot::Idle),
            epochs: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            config: options.session,
            engine: options.engine,
            handler: options.handler,
        }))
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn max_packet_size(&self) -> usize {
        MAX_PACKET_SIZE
    }

    /// Start accepting offers.
    ///
    /// Connection ids restart at 1.
    pub fn start_server(&self) -> Result<(), RegistryError> {
        let client = self.client.lock();
        if !matches!(*client, ClientSlot::Idle) {
            log::error!("start server rejected: client active");
            return Err(RegistryError::ClientActive);
        }

        let mut server = self.server.lock();
        if let ServerRole::Active(_) = *server {
            log::error!("start server rejected: already started");
            return Err(RegistryError::ServerActive);
        }

        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        *server = ServerRole::Active(ServerTable {
            connections: HashMap::new(),
            peers: HashMap::new(),
            next_id: 1,
            epoch,
        });

        drop(server);
        drop(client);

        log::info!("server started: epoch={}", epoch);

        self.handler.on_server_started();
        Ok(())
    }

    /// Close every server session and stop accepting offers.
    ///
    /// Sessions closed here raise no per-connection events.
    pub async fn stop_server(&self) -> Result<(), RegistryError> {
        let table = {
            let mut server = self.server.lock();
            match std::mem::replace(&mut *server, ServerRole::Inactive) {
                ServerRole::Active(table) => table,
                ServerRole::Inactive => {
                    log::error!("stop server rejected: server not started");
                    return Err(RegistryError::ServerInactive);
                }
            }
        };

        log::info!(
            "server stopping: epoch={}, connections={}",
            table.epoch,
            table.connections.len()
        );

        for record in table.connections.into_values() {
            record.session.close().await;
        }

        self.handler.on_server_stopped();
        Ok(())
    }

    pub fn server_active(&self) -> bool {
        matches!(*self.server.lock(), ServerRole::Active(_))
    }

    pub async fn server_send(
        &self,
        id: ConnectionId,
        channel: usize,
        data: Bytes,
    ) -> Result<(), RegistryError> {
        let session = self.server_session(id).ok_or_else(|| {
            log::error!("server send: unknown connection={}", id);
            RegistryError::UnknownConnection(id)
        })?;

        Ok(session.send(channel, data).await?)
    }

    /// Drop a remote client.
    ///
    /// The application hears about it through `on_server_disconnected` if
    /// the session was connected.
    pub async fn server_disconnect(&self, id: ConnectionId) -> Result<(), RegistryError> {
        let record = {
            let mut server = self.server.lock();
            match &mut *server {
                ServerRole::Active(table) => table.remove(id),
                ServerRole::Inactive => None,
            }
        };

        let Some(record) = record else {
            log::error!("server disconnect: unknown connection={}", id);
            return Err(RegistryError::UnknownConnection(id));
        };

        log::info!("server disconnect: id={}, peer={}", id, record.peer);

        record.session.close().await;
        Ok(())
    }

    /// The signaling address of the peer behind a connection.
    pub fn server_peer(&self, id: ConnectionId) -> Option<A> {
        match &*self.server.lock() {
            ServerRole::Active(table) => table.connections.get(&id).map(|it| it.peer.clone()),
            ServerRole::Inactive => None,
        }
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids = match &*self.server.lock() {
            ServerRole::Active(table) => table.connections.keys().copied().collect(),
            ServerRole::Inactive => Vec::new(),
        };

        ids.sort_unstable();
        ids
    }

    pub fn server_session(&self, id: ConnectionId) -> Option<Session<E>> {
        match &*self.server.lock() {
            ServerRole::Active(table) => table.connections.get(&id).map(|it| it.session.clone()),
            ServerRole::Inactive => None,
        }
    }

    pub fn client_connected(&self) -> bool {
        match &*self.client.lock() {
            ClientSlot::Active(session) => session.is_connected(),
            _ => false,
        }
    }

    pub fn client_session(&self) -> Option<Session<E>> {
        match &*self.client.lock() {
            ClientSlot::Active(session) => Some(session.clone()),
            _ => None,
        }
    }

    pub async fn client_send(&self, channel: usize, data: Bytes) -> Result<(), RegistryError> {
        let session = self.client_session().ok_or_else(|| {
            log::error!("client send: client not connected");
            RegistryError::ClientInactive
        })?;

        Ok(session.send(channel, data).await?)
    }

    /// Close the client session, or cancel the offer being prepared.
    pub async fn client_disconnect(&self) -> Result<(), RegistryError> {
        let slot = std::mem::replace(&mut *self.client.lock(), ClientSlot::Idle);
        match slot {
            ClientSlot::Active(session) => {
                log::info!("client disconnect: session={}", session.id());

                session.close().await;
                Ok(())
            }
            ClientSlot::Negotiating(attempt) => {
                log::info!("client disconnect: offer canceled, attempt={}", attempt);
                Ok(())
            }
            ClientSlot::Idle => {
                log::error!("client disconnect: client not connected");
                Err(RegistryError::ClientInactive)
            }
        }
    }

    /// Stop the server if it runs and drop the client if there is one.
    pub async fn shutdown(&self) {
        log::info!("transport shutdown");

        if self.server_active() {
            let _ = self.stop_server().await;
        }

        if !matches!(*self.client.lock(), ClientSlot::Idle) {
            let _ = self.client_disconnect().await;
        }
    }

    /// Reserve the client slot before an offer is created.
    pub(crate) fn begin_client(&self) -> Result<u64, RegistryError> {
        let mut client = self.client.lock();
        if self.server_active() {
            log::error!("client connect rejected: server already started");
            return Err(RegistryError::ServerActive);
        }

        if !matches!(*client, ClientSlot::Idle) {
            log::error!("client connect rejected: transport already running as client");
            return Err(RegistryError::ClientActive);
        }

        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        *client = ClientSlot::Negotiating(attempt);
        Ok(attempt)
    }

    /// Install the session of a client attempt.
    ///
    /// Returns false when the attempt was canceled meanwhile, the caller then
    /// owns the session and has to close it.
    pub(crate) fn attach_client(self: &Arc<Self>, attempt: u64, session: &Session<E>) -> bool {
        let mut client = self.client.lock();
        if !matches!(*client, ClientSlot::Negotiating(it) if it == attempt) {
            return false;
        }

        let hook = ClientHook {
            registry: Arc::downgrade(self),
            session: session.id(),
        };

        if let Err(e) = session.subscribe(hook) {
            log::error!("client session subscribe failed: {}", e);
            return false;
        }

        *client = ClientSlot::Active(session.clone());
        true
    }

    /// Give the slot back after a failed attempt.
    pub(crate) fn abort_client(&self, attempt: u64) {
        let mut client = self.client.lock();
        if matches!(*client, ClientSlot::Negotiating(it) if it == attempt) {
            *client = ClientSlot::Idle;
        }
    }

    /// Release the slot if it still holds this session.
    fn release_client(&self, session: u64) -> Option<Session<E>> {
        let mut client = self.client.lock();
        if matches!(&*client, ClientSlot::Active(it) if it.id() == session) {
            if let ClientSlot::Active(session) = std::mem::replace(&mut *client, ClientSlot::Idle) {
                return Some(session);
            }
        }

        None
    }

    /// Tear down a client attempt refused by the remote.
    pub(crate) async fn decline_client(&self, reason: &str) {
        let slot = {
            let mut client = self.client.lock();
            if matches!(*client, ClientSlot::Idle) {
                log::warn!("decline ignored: no client attempt");
                return;
            }

            std::mem::replace(&mut *client, ClientSlot::Idle)
        };

        log::info!("client declined: reason={}", reason);

        if let ClientSlot::Active(session) = slot {
            session.close().await;
        }

        self.handler.on_client_declined(reason);
    }

    /// Record the session of an accepted offer and assign its id.
    pub(crate) fn accept_server_session(
        self: &Arc<Self>,
        peer: A,
        session: &Session<E>,
    ) -> Result<ConnectionId, RegistryError> {
        let mut server = self.server.lock();
        let ServerRole::Active(table) = &mut *server else {
            return Err(RegistryError::ServerInactive);
        };

        if table.peers.contains_key(&peer) {
            return Err(RegistryError::DuplicatePeer(peer.to_string()));
        }

        let id = table.next_id;
        let hook = ServerHook {
            registry: Arc::downgrade(self),
            session: session.id(),
            epoch: table.epoch,
            id,
        };

        session.subscribe(hook)?;

        table.next_id += 1;
        table.peers.insert(peer.clone(), id);
        table.connections.insert(
            id,
            ConnectionRecord {
                session: session.clone(),
                peer: peer.clone(),
                id,
            },
        );

        log::info!("server connection: id={}, peer={}", id, peer);
        Ok(id)
    }

    /// Find the server session negotiating with a peer.
    pub(crate) fn resolve_peer(&self, peer: &A) -> Option<Session<E>> {
        match &*self.server.lock() {
            ServerRole::Active(table) => table
                .peers
                .get(peer)
                .and_then(|id| table.connections.get(id))
                .map(|it| it.session.clone()),
            ServerRole::Inactive => None,
        }
    }

    fn current_epoch(&self) -> Option<u64> {
        match &*self.server.lock() {
            ServerRole::Active(table) => Some(table.epoch),
            ServerRole::Inactive => None,
        }
    }

    /// Remove a record, only if it belongs to the given run and session.
    fn remove_server_connection(
        &self,
        epoch: u64,
        id: ConnectionId,
        session: u64,
    ) -> Option<ConnectionRecord<E, A>> {
        let mut server = self.server.lock();
        let ServerRole::Active(table) = &mut *server else {
            return None;
        };

        if table.epoch != epoch {
            return None;
        }

        if table.connections.get(&id).map(|it| it.session.id()) != Some(session) {
            return None;
        }

        table.remove(id)
    }
}

struct ClientHook<E: Engine, H, A> {
    registry: Weak<TransportRegistry<E, H, A>>,
    session: u64,
}

impl<E, H, A> ClientHook<E, H, A>
where
    E: Engine,
    H: TransportHandler,
    A: PeerAddress,
{
    fn release(&self, registry: &TransportRegistry<E, H, A>) {
        if let Some(session) = registry.release_client(self.session) {
            tokio::spawn(async move { session.close().await });
        }
    }
}

impl<E, H, A> SessionHandler for ClientHook<E, H, A>
where
    E: Engine,
    H: TransportHandler,
    A: PeerAddress,
{
    fn on_connected(&self) {
        if let Some(registry) = self.registry.upgrade() {
            log::info!("client connected: session={}", self.session);
            registry.handler.on_client_connected();
        }
    }

    fn on_disconnected(&self) {
        if let Some(registry) = self.registry.upgrade() {
            log::info!("client disconnected: session={}", self.session);

            self.release(&registry);
            registry.handler.on_client_disconnected();
        }
    }

    fn on_message(&self, channel: usize, data: Bytes) {
        if let Some(registry) = self.registry.upgrade() {
            registry.handler.on_client_data(channel, data);
        }
    }

    fn on_failed(&self, reason: &str) {
        if let Some(registry) = self.registry.upgrade() {
            log::error!("client session failed: session={}, reason={}", self.session, reason);
            self.release(&registry);
        }
    }
}

struct ServerHook<E: Engine, H, A> {
    registry: Weak<TransportRegistry<E, H, A>>,
    session: u64,
    epoch: u64,
    id: ConnectionId,
}

impl<E, H, A> ServerHook<E, H, A>
where
    E: Engine,
    H: TransportHandler,
    A: PeerAddress,
{
    /// The registry, if the server run this hook belongs to is still going.
    fn registry(&self) -> Option<Arc<TransportRegistry<E, H, A>>> {
        let registry = self.registry.upgrade()?;
        (registry.current_epoch() == Some(self.epoch)).then_some(registry)
    }

    fn release(&self, registry: &TransportRegistry<E, H, A>) {
        if let Some(record) = registry.remove_server_connection(self.epoch, self.id, self.session) {
            tokio::spawn(async move { record.session.close().await });
        }
    }
}

impl<E, H, A> SessionHandler for ServerHook<E, H, A>
where
    E: Engine,
    H: TransportHandler,
    A: PeerAddress,
{
    fn on_connected(&self) {
        if let Some(registry) = self.registry() {
            log::info!("server connected: id={}", self.id);
            registry.handler.on_server_connected(self.id);
        }
    }

    fn on_disconnected(&self) {
        let Some(registry) = self.registry() else {
            log::debug!("server disconnected after stop: id={}", self.id);
            return;
        };

        log::info!("server disconnected: id={}", self.id);

        self.release(&registry);
        registry.handler.on_server_disconnected(self.id);
    }

    fn on_message(&self, channel: usize, data: Bytes) {
        if let Some(registry) = self.registry() {
            registry.handler.on_server_data(self.id, channel, data);
        }
    }

    fn on_failed(&self, reason: &str) {
        if let Some(registry) = self.registry() {
            log::error!("server session failed: id={}, reason={}", self.id, reason);
            self.release(&registry);
        }
    }
}
