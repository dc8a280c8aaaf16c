use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, bail};
use bytes::Bytes;
use codec::MessageType;
use parking_lot::Mutex;
use rtc_link_client::OverlaySocket;
use service::{
    ConnectionId, RegistryOptions, SessionConfig, Signaler, SignalerError, SignalingTransport,
    TransportError, TransportHandler, TransportRegistry, engine::mock::MockEngine,
};

#[derive(Default, Clone)]
struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    fn has(&self, event: &str) -> bool {
        self.0.lock().iter().any(|it| it == event)
    }
}

impl TransportHandler for Events {
    fn on_client_connected(&self) {
        self.0.lock().push("client connected".to_string());
    }

    fn on_server_connected(&self, id: ConnectionId) {
        self.0.lock().push(format!("server connected {id}"));
    }

    fn on_server_data(&self, id: ConnectionId, channel: usize, data: Bytes) {
        self.0
            .lock()
            .push(format!("server data {id} {channel} {}", String::from_utf8_lossy(&data)));
    }
}

type OverlaySignaler = Signaler<OverlaySocket, MockEngine, Events>;

async fn peer(engine: &MockEngine) -> Result<(OverlaySignaler, Events)> {
    let events = Events::default();
    let registry = TransportRegistry::new(RegistryOptions {
        session: SessionConfig::default(),
        handler: events.clone(),
        engine: engine.clone(),
    })?;

    let socket = OverlaySocket::bind("127.0.0.1:0".parse()?).await?;
    let signaler = Signaler::new(Arc::new(socket), registry);

    {
        let signaler = signaler.clone();
        tokio::spawn(async move { signaler.run().await });
    }

    Ok((signaler, events))
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) -> Result<()> {
    for _ in 0..200 {
        if condition() {
            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    bail!("timed out waiting for: {what}")
}

#[tokio::test]
async fn peers_negotiate_over_udp() -> Result<()> {
    let engine = MockEngine::new();
    let (host, host_events) = peer(&engine).await?;
    let (guest, guest_events) = peer(&engine).await?;

    host.registry().start_server()?;

    let host_addr = host.transport().local_addr();
    guest.offer(host_addr).await?;

    wait_until("server connected", || host_events.has("server connected 1")).await?;
    wait_until("client connected", || guest_events.has("client connected")).await?;

    assert_eq!(
        host.registry().server_peer(1),
        Some(guest.transport().local_addr())
    );

    guest
        .registry()
        .client_send(0, Bytes::from_static(b"over udp"))
        .await?;

    wait_until("data", || host_events.has("server data 1 0 over udp")).await?;
    Ok(())
}

#[tokio::test]
async fn undecodable_datagram_does_not_close_the_socket() -> Result<()> {
    let socket = OverlaySocket::bind("127.0.0.1:0".parse()?).await?;
    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
    let target: SocketAddr = socket.local_addr();

    sender.send_to(b"not json", target).await?;
    sender.send_to(br#"{"type":7,"data":""}"#, target).await?;
    sender.send_to(br#"{"type":2,"data":"busy"}"#, target).await?;

    assert!(matches!(socket.recv().await, Some(Err(TransportError::Codec(_)))));
    assert!(matches!(socket.recv().await, Some(Err(TransportError::Codec(_)))));

    let Some(Ok(envelope)) = socket.recv().await else {
        bail!("expected a decline");
    };

    assert_eq!(envelope.kind, MessageType::Decline);
    assert_eq!(envelope.data, "busy");
    assert_eq!(envelope.from, sender.local_addr()?);
    Ok(())
}

#[tokio::test]
async fn wildcard_socket_refuses_an_offer_to_its_loopback_address() -> Result<()> {
    let registry = TransportRegistry::new(RegistryOptions {
        session: SessionConfig::default(),
        handler: Events::default(),
        engine: MockEngine::new(),
    })?;

    let socket = OverlaySocket::bind("0.0.0.0:0".parse()?).await?;
    let loopback = SocketAddr::from(([127, 0, 0, 1], socket.local_addr().port()));
    let signaler: OverlaySignaler = Signaler::new(Arc::new(socket), registry);

    assert!(matches!(
        signaler.offer(loopback).await,
        Err(SignalerError::SelfAddressed)
    ));

    assert!(signaler.registry().client_session().is_none());
    Ok(())
}
