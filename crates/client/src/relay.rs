use crate::Error;

use std::sync::Arc;

use codec::{
    MessageType, Rejection, SignalMessage,
    handshake::{DEFAULT_PROTOCOL_TAG, IDENTITY_HEADER, PROTOCOL_HEADER},
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use service::{Envelope, SignalingTransport, TransportError};
use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    watch,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Message, client::IntoClientRequest, http::HeaderValue},
};

pub struct RelayClientBuilder {
    url: String,
    identity: String,
    protocol_tag: String,
}

impl RelayClientBuilder {
    pub fn new(url: &str, identity: &str) -> Self {
        Self {
            protocol_tag: DEFAULT_PROTOCOL_TAG.to_string(),
            identity: identity.to_string(),
            url: url.to_string(),
        }
    }

    /// The tag the relay expects in the `user-agent` header.
    pub fn with_protocol_tag(&mut self, tag: &str) -> &mut Self {
        self.protocol_tag = tag.to_string();
        self
    }

    /// Open the WebSocket and register the identity.
    ///
    /// The relay accepts the upgrade before it checks the identity, so a
    /// refusal is only seen later, see [`RelayClient::closed`].
    pub async fn connect(&self) -> Result<RelayClient, Error> {
        let mut request = self.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            PROTOCOL_HEADER,
            HeaderValue::from_str(&self.protocol_tag)
                .map_err(|_| Error::InvalidHeader(PROTOCOL_HEADER))?,
        );

        headers.insert(
            IDENTITY_HEADER,
            HeaderValue::from_str(&self.identity)
                .map_err(|_| Error::InvalidHeader(IDENTITY_HEADER))?,
        );

        let (stream, _) = connect_async(request).await?;
        let (mut writer, mut reader) = stream.split();

        log::info!("relay connected: url={}, identity={}", self.url, self.identity);

        let (outbound, mut outbound_rx) = unbounded_channel::<Message>();
        let (inbound_tx, inbound) = unbounded_channel();
        let (closed_tx, closed) = watch::channel(false);
        let rejection = Arc::new(Mutex::new(None));

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if let Err(e) = writer.send(message).await {
                    log::warn!("relay write failed: {}", e);
                    break;
                }

                if is_close {
                    break;
                }
            }
        });

        {
            let rejection = rejection.clone();
            tokio::spawn(async move {
                while let Some(message) = reader.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            let envelope = SignalMessage::decode(&text)
                                .map(|it| Envelope {
                                    kind: it.kind,
                                    from: it.from,
                                    data: it.data,
                                })
                                .map_err(TransportError::from);

                            if inbound_tx.send(envelope).is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(frame)) => {
                            let code = frame.map(|it| u16::from(it.code));
                            if let Some(reason) = code.and_then(Rejection::from_code) {
                                log::error!("relay rejected connection: {}", reason);
                                rejection.lock().replace(reason);
                            } else {
                                log::info!("relay closed connection: code={:?}", code);
                            }

                            break;
                        }
                        Ok(_) => (),
                        Err(e) => {
                            log::warn!("relay read failed: {}", e);
                            break;
                        }
                    }
                }

                let _ = closed_tx.send(true);
            });
        }

        Ok(RelayClient {
            inbound: tokio::sync::Mutex::new(inbound),
            identity: self.identity.clone(),
            rejection,
            outbound,
            closed,
        })
    }
}

/// A peer registered on the relay under its identity.
pub struct RelayClient {
    identity: String,
    outbound: UnboundedSender<Message>,
    inbound: tokio::sync::Mutex<UnboundedReceiver<Result<Envelope<String>, TransportError>>>,
    rejection: Arc<Mutex<Option<Rejection>>>,
    closed: watch::Receiver<bool>,
}

impl RelayClient {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Why the relay refused us, if it did.
    pub fn rejection(&self) -> Option<Rejection> {
        *self.rejection.lock()
    }

    /// Wait until the connection is gone.
    ///
    /// Fails with [`Error::Rejected`] if the relay refused the identity.
    pub async fn closed(&self) -> Result<(), Error> {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|it| *it).await;

        match self.rejection() {
            Some(reason) => Err(Error::Rejected(reason)),
            None => Ok(()),
        }
    }

    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }
}

impl SignalingTransport for RelayClient {
    type Address = String;

    fn local_address(&self) -> Option<String> {
        self.is_open().then(|| self.identity.clone())
    }

    async fn send(&self, to: &String, kind: MessageType, data: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }

        let text = SignalMessage::new(kind, &self.identity, to, data).encode()?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Option<Result<Envelope<String>, TransportError>> {
        self.inbound.lock().await.recv().await
    }
}
