#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use ahash::{HashMap, HashMapExt};
use anyhow::{Result, bail};
use bytes::Bytes;
use codec::MessageType;
use parking_lot::Mutex;
use rtc_link_service::{
    ConnectionId, Envelope, RegistryOptions, SessionConfig, Signaler, SignalingTransport,
    TransportError, TransportHandler, TransportRegistry, engine::mock::MockEngine,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

pub type Registry = TransportRegistry<MockEngine, Recorder, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub kind: MessageType,
    pub from: String,
    pub to: String,
}

/// Routes messages between named peers, like the relay does.
#[derive(Default)]
pub struct Hub {
    peers: Mutex<HashMap<String, UnboundedSender<Envelope<String>>>>,
    sent: Mutex<Vec<Sent>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn join(self: &Arc<Self>, name: &str) -> Arc<HubTransport> {
        let (sender, receiver) = unbounded_channel();
        self.peers.lock().insert(name.to_string(), sender);

        Arc::new(HubTransport {
            receiver: tokio::sync::Mutex::new(receiver),
            name: name.to_string(),
            hub: self.clone(),
        })
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn sent_by(&self, from: &str) -> Vec<MessageType> {
        self.sent
            .lock()
            .iter()
            .filter(|it| it.from == from)
            .map(|it| it.kind)
            .collect()
    }
}

pub struct HubTransport {
    name: String,
    hub: Arc<Hub>,
    receiver: tokio::sync::Mutex<UnboundedReceiver<Envelope<String>>>,
}

impl SignalingTransport for HubTransport {
    type Address = String;

    fn local_address(&self) -> Option<String> {
        Some(self.name.clone())
    }

    async fn send(&self, to: &String, kind: MessageType, data: String) -> Result<(), TransportError> {
        self.hub.sent.lock().push(Sent {
            from: self.name.clone(),
            to: to.clone(),
            kind,
        });

        if let Some(peer) = self.hub.peers.lock().get(to) {
            let _ = peer.send(Envelope {
                from: self.name.clone(),
                kind,
                data,
            });
        }

        Ok(())
    }

    async fn recv(&self) -> Option<Result<Envelope<String>, TransportError>> {
        self.receiver.lock().await.recv().await.map(Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ClientConnected,
    ClientDisconnected,
    ClientDeclined(String),
    ClientData(usize, Bytes),
    ServerStarted,
    ServerStopped,
    ServerConnected(ConnectionId),
    ServerDisconnected(ConnectionId),
    ServerData(ConnectionId, usize, Bytes),
}

#[derive(Default, Clone)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events.lock().iter().filter(|it| *it == event).count()
    }

    pub fn has(&self, event: &Event) -> bool {
        self.count(event) > 0
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl TransportHandler for Recorder {
    fn on_client_connected(&self) {
        self.push(Event::ClientConnected);
    }

    fn on_client_disconnected(&self) {
        self.push(Event::ClientDisconnected);
    }

    fn on_client_declined(&self, reason: &str) {
        self.push(Event::ClientDeclined(reason.to_string()));
    }

    fn on_client_data(&self, channel: usize, data: Bytes) {
        self.push(Event::ClientData(channel, data));
    }

    fn on_server_started(&self) {
        self.push(Event::ServerStarted);
    }

    fn on_server_stopped(&self) {
        self.push(Event::ServerStopped);
    }

    fn on_server_connected(&self, id: ConnectionId) {
        self.push(Event::ServerConnected(id));
    }

    fn on_server_disconnected(&self, id: ConnectionId) {
        self.push(Event::ServerDisconnected(id));
    }

    fn on_server_data(&self, id: ConnectionId, channel: usize, data: Bytes) {
        self.push(Event::ServerData(id, channel, data));
    }
}

pub struct Peer {
    pub signaler: Signaler<HubTransport, MockEngine, Recorder>,
    pub registry: Arc<Registry>,
    pub recorder: Recorder,
}

impl Peer {
    /// Join the hub and start handling inbound messages.
    pub fn spawn(hub: &Arc<Hub>, name: &str, engine: &MockEngine) -> Result<Self> {
        Self::spawn_with(hub, name, engine, SessionConfig::default())
    }

    pub fn spawn_with(
        hub: &Arc<Hub>,
        name: &str,
        engine: &MockEngine,
        session: SessionConfig,
    ) -> Result<Self> {
        let recorder = Recorder::default();
        let registry = Registry::new(RegistryOptions {
            handler: recorder.clone(),
            engine: engine.clone(),
            session,
        })?;

        let signaler = Signaler::new(hub.join(name), registry.clone());

        {
            let signaler = signaler.clone();
            tokio::spawn(async move { signaler.run().await });
        }

        Ok(Self {
            signaler,
            registry,
            recorder,
        })
    }
}

/// Poll until the condition holds, fail after two seconds.
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) -> Result<()> {
    for _ in 0..200 {
        if condition() {
            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    bail!("timed out waiting for: {what}")
}

/// Give pending tasks a chance to run, for asserting that nothing happens.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
