//! Engine backed by the `webrtc` crate.
//!
//! Only data channels are used, no media is negotiated.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use codec::{IceCandidate, SdpType, SessionDescription};
use ::webrtc::{
    api::{
        API, APIBuilder, interceptor_registry::register_default_interceptors,
        media_engine::MediaEngine,
    },
    data_channel::{
        RTCDataChannel, data_channel_init::RTCDataChannelInit,
        data_channel_message::DataChannelMessage,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        RTCPeerConnection, configuration::RTCConfiguration,
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
    },
};

use super::{
    ChannelState, ConnectionObserver, ConnectionState, DataChannel, Engine, EngineError,
    PeerConnection, Reliability, SessionConfig,
};

type Observer = Weak<dyn ConnectionObserver<WebRtcChannel>>;

impl From<::webrtc::Error> for EngineError {
    fn from(value: ::webrtc::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

#[derive(Clone)]
pub struct WebRtcEngine {
    api: Arc<API>,
}

impl WebRtcEngine {
    pub fn new() -> Result<Self, EngineError> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)?;

        Ok(Self {
            api: Arc::new(
                APIBuilder::new()
                    .with_media_engine(media)
                    .with_interceptor_registry(registry)
                    .build(),
            ),
        })
    }
}

impl Engine for WebRtcEngine {
    type Connection = WebRtcConnection;

    async fn create_connection(
        &self,
        config: &SessionConfig,
        observer: Arc<dyn ConnectionObserver<WebRtcChannel>>,
    ) -> Result<Self::Connection, EngineError> {
        let peer = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers: vec![RTCIceServer {
                        urls: config.ice_servers.clone(),
                        ..Default::default()
                    }],
                    ..Default::default()
                })
                .await?,
        );

        let observer = Arc::downgrade(&observer);

        {
            let observer = observer.clone();
            peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let observer = observer.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };

                    match (candidate.to_json(), observer.upgrade()) {
                        (Ok(init), Some(observer)) => observer.on_ice_candidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }),
                        (Err(e), _) => log::warn!("ice candidate not serializable: {}", e),
                        _ => (),
                    }
                })
            }));
        }

        {
            let observer = observer.clone();
            peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let observer = observer.clone();
                Box::pin(async move {
                    let state = match state {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };

                    if let Some(observer) = observer.upgrade() {
                        observer.on_connection_state(state);
                    }
                })
            }));
        }

        {
            let observer = observer.clone();
            peer.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let observer = observer.clone();
                Box::pin(async move {
                    let channel = WebRtcChannel::bind(channel, observer.clone());
                    if let Some(observer) = observer.upgrade() {
                        observer.on_data_channel(channel);
                    }
                })
            }));
        }

        Ok(WebRtcConnection { peer, observer })
    }
}

pub struct WebRtcConnection {
    peer: Arc<RTCPeerConnection>,
    observer: Observer,
}

impl WebRtcConnection {
    fn description(description: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
        Ok(match description.kind {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        })
    }
}

impl PeerConnection for WebRtcConnection {
    type Channel = WebRtcChannel;

    async fn create_channel(
        &self,
        label: &str,
        reliability: Reliability,
    ) -> Result<WebRtcChannel, EngineError> {
        let init = match reliability {
            Reliability::Reliable => RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            },
            Reliability::Unreliable => RTCDataChannelInit {
                ordered: Some(false),
                max_retransmits: Some(0),
                ..Default::default()
            },
        };

        let channel = self.peer.create_data_channel(label, Some(init)).await?;
        Ok(WebRtcChannel::bind(channel, self.observer.clone()))
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        Ok(SessionDescription::offer(self.peer.create_offer(None).await?.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        Ok(SessionDescription::answer(self.peer.create_answer(None).await?.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        Ok(self
            .peer
            .set_local_description(Self::description(description)?)
            .await?)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        Ok(self
            .peer
            .set_remote_description(Self::description(description)?)
            .await?)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        Ok(self
            .peer
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?)
    }

    async fn close(&self) {
        if let Err(e) = self.peer.close().await {
            log::warn!("peer connection close failed: {}", e);
        }
    }
}

#[derive(Clone)]
pub struct WebRtcChannel {
    inner: Arc<RTCDataChannel>,
    label: String,
}

impl WebRtcChannel {
    fn bind(channel: Arc<RTCDataChannel>, observer: Observer) -> Self {
        let label = channel.label().to_string();

        {
            let (observer, label) = (observer.clone(), label.clone());
            channel.on_open(Box::new(move || {
                Box::pin(async move {
                    if let Some(observer) = observer.upgrade() {
                        observer.on_channel_state(&label, ChannelState::Open);
                    }
                })
            }));
        }

        {
            let (observer, label) = (observer.clone(), label.clone());
            channel.on_close(Box::new(move || {
                let (observer, label) = (observer.clone(), label.clone());
                Box::pin(async move {
                    if let Some(observer) = observer.upgrade() {
                        observer.on_channel_state(&label, ChannelState::Closed);
                    }
                })
            }));
        }

        {
            let label = label.clone();
            channel.on_message(Box::new(move |message: DataChannelMessage| {
                let (observer, label) = (observer.clone(), label.clone());
                Box::pin(async move {
                    if let Some(observer) = observer.upgrade() {
                        observer.on_message(&label, message.data);
                    }
                })
            }));
        }

        Self {
            inner: channel,
            label,
        }
    }
}

impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Bytes) -> Result<(), EngineError> {
        self.inner.send(&data).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.inner.close().await {
            log::warn!("data channel close failed: {}", e);
        }
    }
}
