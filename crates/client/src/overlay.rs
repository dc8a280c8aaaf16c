use crate::Error;

use std::net::SocketAddr;

use codec::{MessageType, OverlayFrame};
use service::{Envelope, SignalingTransport, TransportError};
use tokio::net::UdpSocket;

/// Largest payload of a single UDP datagram.
const MAX_DATAGRAM_SIZE: usize = 65507;

/// Signaling straight between peers over UDP.
///
/// A peer is addressed by its socket address, one datagram carries one
/// message, and the datagram source tells who sent it.
pub struct OverlaySocket {
    socket: UdpSocket,
    local: SocketAddr,
}

impl OverlaySocket {
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let socket = UdpSocket::bind(addr).await?;
        let local = socket.local_addr()?;

        log::info!("overlay socket bound: addr={}", local);

        Ok(Self { socket, local })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl SignalingTransport for OverlaySocket {
    type Address = SocketAddr;

    fn local_address(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    async fn send(&self, to: &SocketAddr, kind: MessageType, data: String) -> Result<(), TransportError> {
        let bytes = OverlayFrame::new(kind, data).encode()?;
        self.socket.send_to(&bytes, to).await?;
        Ok(())
    }

    async fn recv(&self) -> Option<Result<Envelope<SocketAddr>, TransportError>> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (size, from) = match self.socket.recv_from(&mut buf).await {
            Ok(it) => it,
            Err(e) => return Some(Err(e.into())),
        };

        Some(
            OverlayFrame::decode(&buf[..size])
                .map(|frame| Envelope {
                    kind: frame.kind,
                    data: frame.data,
                    from,
                })
                .map_err(TransportError::from),
        )
    }
}
