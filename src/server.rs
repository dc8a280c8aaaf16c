use crate::{
    config::Config,
    router::{Registration, Router, Tx},
};

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use codec::{
    Credentials,
    handshake::{IDENTITY_HEADER, PROTOCOL_HEADER},
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::{UnboundedReceiver, unbounded_channel},
};
use tokio_tungstenite::{
    WebSocketStream, accept_hdr_async_with_config,
    tungstenite::{
        Message,
        handshake::server::{Callback, ErrorResponse, Request, Response},
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

/// How long a refused peer gets to acknowledge the close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Websocket upgrade guarder.
///
/// Only records the handshake headers. The upgrade always completes, a
/// refusal is sent afterwards as a close code the peer can read.
struct Guarder {
    credentials: Arc<Mutex<Credentials>>,
}

impl Guarder {
    fn header(req: &Request, name: &str) -> Option<String> {
        req.headers()
            .get(name)
            .and_then(|it| it.to_str().ok())
            .map(str::to_string)
    }
}

impl Callback for Guarder {
    fn on_request(self, req: &Request, res: Response) -> Result<Response, ErrorResponse> {
        *self.credentials.lock() = Credentials {
            protocol_tag: Self::header(req, PROTOCOL_HEADER),
            identity: Self::header(req, IDENTITY_HEADER),
        };

        Ok(res)
    }
}

/// One registered peer of the relay.
pub struct Connection {
    router: Arc<Router>,
    socket: WebSocketStream<TcpStream>,
    registration: Registration,
    rx: UnboundedReceiver<String>,
}

impl Connection {
    /// Upgrade the stream and register the peer.
    ///
    /// Returns `None` if the peer was refused, the socket is closed with
    /// the close code of the refusal by then.
    pub async fn accept(
        stream: TcpStream,
        router: Arc<Router>,
        config: &Config,
    ) -> Result<Option<Self>> {
        let credentials = Arc::new(Mutex::new(Credentials::default()));
        let mut socket = accept_hdr_async_with_config(
            stream,
            Guarder {
                credentials: credentials.clone(),
            },
            Some(config.server.websocket_config()),
        )
        .await?;

        let credentials = credentials.lock().clone();
        let (tx, rx) = unbounded_channel();
        match router.connect(&credentials, &config.server.protocol_tag, Tx(tx)) {
            Ok(registration) => Ok(Some(Self {
                registration,
                router,
                socket,
                rx,
            })),
            Err(rejection) => {
                log::warn!(
                    "peer refused: identity={:?}, reason={}",
                    credentials.identity,
                    rejection
                );

                socket
                    .close(Some(CloseFrame {
                        code: CloseCode::from(rejection.code()),
                        reason: rejection.reason().into(),
                    }))
                    .await?;

                // read until the peer acknowledged the close
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
                    while let Some(Ok(_)) = socket.next().await {}
                })
                .await;

                Ok(None)
            }
        }
    }

    /// Relay messages until either side closes.
    pub async fn poll(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                Some(body) = self.rx.recv() => self.socket.send(Message::Text(body)).await?,
                message = self.socket.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        self.router.forward(text);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => (),
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }

        let _ = self.socket.close(None).await;
        Ok(())
    }

    pub async fn launch(stream: TcpStream, addr: SocketAddr, router: Arc<Router>, config: Arc<Config>) {
        let mut connection = match Self::accept(stream, router.clone(), &config).await {
            Ok(Some(connection)) => connection,
            Ok(None) => return,
            Err(e) => {
                log::warn!("websocket handshake failed: addr={}, error={}", addr, e);
                return;
            }
        };

        if let Err(e) = connection.poll().await {
            log::warn!(
                "connection error: identity={}, error={}",
                connection.registration.identity,
                e
            );
        }

        router.disconnect(&connection.registration);
    }
}

/// The relay server: one task per WebSocket connection, all sharing one
/// routing table.
pub struct Relay {
    listener: TcpListener,
    router: Arc<Router>,
    config: Arc<Config>,
}

impl Relay {
    pub async fn bind(config: Arc<Config>) -> Result<Self> {
        let listener = TcpListener::bind(config.server.listen).await?;

        log::info!(
            "relay listening: addr={}, protocol-tag={}",
            listener.local_addr()?,
            config.server.protocol_tag
        );

        Ok(Self {
            router: Router::new(),
            listener,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    tokio::spawn(Connection::launch(
                        stream,
                        addr,
                        self.router.clone(),
                        self.config.clone(),
                    ));
                }
                Err(e) => log::error!("accept failed: {}", e),
            }
        }
    }
}
