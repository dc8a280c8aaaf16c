use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use ahash::{HashMap, HashMapExt};
use codec::{Credentials, Rejection};
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;

/// Sender half into a connection task, carries text frames for the peer.
#[derive(Debug, Clone)]
pub struct Tx(pub UnboundedSender<String>);

impl Tx {
    /// # Test
    ///
    /// ```
    /// use rtc_link::router::Tx;
    /// use tokio::sync::mpsc::unbounded_channel;
    ///
    /// let (sender, mut receiver) = unbounded_channel();
    /// let tx = Tx(sender);
    ///
    /// assert!(tx.send("hello".to_string()));
    /// assert_eq!(receiver.try_recv().ok(), Some("hello".to_string()));
    ///
    /// drop(receiver);
    /// assert!(!tx.send("hello".to_string()));
    /// ```
    pub fn send(&self, body: String) -> bool {
        self.0.send(body).is_ok()
    }
}

/// A live registration on the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub identity: String,
    pub handle: u64,
}

struct Route {
    handle: u64,
    tx: Tx,
}

/// Identity routing table of the relay.
///
/// One route per identity. The relay never looks into the payload of a
/// message, only at its `from` and `to`.
pub struct Router {
    handles: AtomicU64,
    routes: RwLock<HashMap<String, Route>>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: RwLock::new(HashMap::with_capacity(1024)),
            handles: AtomicU64::new(1),
        })
    }

    /// Bind an identity to a connection.
    ///
    /// # Test
    ///
    /// ```
    /// use rtc_link::router::{Router, Tx};
    /// use codec::{Credentials, Rejection};
    /// use tokio::sync::mpsc::unbounded_channel;
    ///
    /// let router = Router::new();
    /// let credentials = Credentials {
    ///     protocol_tag: Some("rtc-link".to_string()),
    ///     identity: Some("host".to_string()),
    /// };
    ///
    /// let (sender, _receiver) = unbounded_channel();
    /// assert!(router.connect(&credentials, "rtc-link", Tx(sender.clone())).is_ok());
    /// assert_eq!(
    ///     router.connect(&credentials, "rtc-link", Tx(sender)),
    ///     Err(Rejection::IdentityOccupied)
    /// );
    /// ```
    pub fn connect(
        &self,
        credentials: &Credentials,
        protocol_tag: &str,
        tx: Tx,
    ) -> Result<Registration, Rejection> {
        let identity = credentials.validate(protocol_tag)?;

        let mut routes = self.routes.write();
        if routes.contains_key(identity) {
            return Err(Rejection::IdentityOccupied);
        }

        let handle = self.handles.fetch_add(1, Ordering::Relaxed);
        routes.insert(identity.to_string(), Route { handle, tx });

        log::info!(
            "peer connected: identity={}, handle={}, connections={}",
            identity,
            handle,
            routes.len()
        );

        Ok(Registration {
            identity: identity.to_string(),
            handle,
        })
    }

    /// Forward a raw message to its recipient, unchanged.
    ///
    /// Returns whether the message was handed to a connection.
    pub fn forward(&self, raw: String) -> bool {
        let route = match codec::Route::parse(&raw) {
            Ok(route) => route,
            Err(e) => {
                log::warn!("message dropped: {}", e);
                return false;
            }
        };

        if route.is_self_addressed() {
            log::warn!("message dropped: self addressed, identity={}", route.from);
            return false;
        }

        let routes = self.routes.read();
        let Some(target) = routes.get(&route.to) else {
            log::warn!(
                "message dropped: recipient not connected, from={}, to={}",
                route.from,
                route.to
            );

            return false;
        };

        if !target.tx.send(raw) {
            log::warn!("message dropped: recipient closing, to={}", route.to);
            return false;
        }

        log::debug!("message forwarded: from={}, to={}", route.from, route.to);
        true
    }

    /// Remove a registration.
    ///
    /// Nothing happens if the identity is bound to another connection by
    /// now.
    pub fn disconnect(&self, registration: &Registration) {
        let mut routes = self.routes.write();
        if !matches!(routes.get(&registration.identity), Some(it) if it.handle == registration.handle) {
            return;
        }

        routes.remove(&registration.identity);

        log::info!(
            "peer disconnected: identity={}, handle={}, connections={}",
            registration.identity,
            registration.handle,
            routes.len()
        );
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.routes.read().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
