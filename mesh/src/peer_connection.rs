use std::sync::Arc;

use async_trait::async_trait;
use derivative::Derivative;
use enclose::enc;
use tokio::sync::mpsc;
use uuid::Uuid;
use webrtc::{
    api::{interceptor_registry::register_default_interceptors, media_engine::MediaEngine, APIBuilder},
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_connection_state::RTCIceConnectionState,
    },
    interceptor::registry::Registry,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::RTPCodecType, rtp_receiver::RTCRtpReceiver,
        rtp_transceiver_direction::RTCRtpTransceiverDirection, RTCRtpTransceiver,
        RTCRtpTransceiverInit,
    },
    track::{track_local::TrackLocal, track_remote::TrackRemote},
};

use crate::{
    config::WebRTCTransportConfig, envelope::ParticipantId, error::Error, media_track::RemoteTrack,
};

/// Callbacks of one peer connection, delivered in the order they fired.
#[derive(Debug)]
pub enum ConnectionEvent {
    IceCandidate(RTCIceCandidateInit),
    Track(Arc<dyn RemoteTrack>),
    IceConnectionStateChange(RTCIceConnectionState),
    PeerConnectionStateChange(RTCPeerConnectionState),
}

/// The media-transport connection owned by one negotiation session.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<RTCSessionDescription, Error>;
    async fn create_answer(&self) -> Result<RTCSessionDescription, Error>;
    async fn set_local_description(&self, sdp: RTCSessionDescription) -> Result<(), Error>;
    async fn set_remote_description(&self, sdp: RTCSessionDescription) -> Result<(), Error>;
    async fn local_description(&self) -> Option<RTCSessionDescription>;
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error>;
    async fn add_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<(), Error>;
    /// Asks the remote side for `kind` media without sending any. Without a
    /// track or receiver of that kind an offer carries no such media section.
    async fn add_receiver(&self, kind: RTPCodecType) -> Result<(), Error>;
    async fn close(&self) -> Result<(), Error>;
}

/// Creates one [`PeerConnection`] per remote participant.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Every callback of the new connection is forwarded into `events`.
    async fn create(
        &self,
        remote_id: &ParticipantId,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, Error>;
}

#[derive(Clone, Debug, Default)]
pub struct WebRTCConnectionFactory {
    config: WebRTCTransportConfig,
}

impl WebRTCConnectionFactory {
    pub fn new(config: WebRTCTransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConnectionFactory for WebRTCConnectionFactory {
    async fn create(
        &self,
        remote_id: &ParticipantId,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, Error> {
        let connection = WebRTCPeerConnection::new(remote_id.clone(), &self.config, events).await?;
        Ok(Arc::new(connection))
    }
}

/// [`PeerConnection`] backed by [`RTCPeerConnection`].
#[derive(Derivative)]
#[derivative(Debug)]
pub struct WebRTCPeerConnection {
    pub id: String,
    pub remote_id: ParticipantId,
    #[derivative(Debug = "ignore")]
    peer_connection: Arc<RTCPeerConnection>,
}

impl WebRTCPeerConnection {
    pub async fn new(
        remote_id: ParticipantId,
        config: &WebRTCTransportConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Self, Error> {
        let id = Uuid::new_v4().to_string();
        let peer_connection = Self::generate_peer_connection(config).await?;

        let connection = Self {
            id,
            remote_id,
            peer_connection: Arc::new(peer_connection),
        };
        connection.ice_state_hooks(events);

        tracing::debug!(
            "WebRTCPeerConnection {} for {} is created",
            connection.id,
            connection.remote_id
        );

        Ok(connection)
    }

    async fn generate_peer_connection(
        config: &WebRTCTransportConfig,
    ) -> Result<RTCPeerConnection, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(config.setting_engine())
            .build();

        let peer_connection = api.new_peer_connection(config.configuration()).await?;
        Ok(peer_connection)
    }

    fn ice_state_hooks(&self, events: mpsc::UnboundedSender<ConnectionEvent>) {
        let peer = self.peer_connection.clone();
        let remote_id = self.remote_id.clone();

        peer.on_ice_candidate(Box::new(enc!((events) move |candidate: Option<RTCIceCandidate>| {
            Box::pin(enc!((events) async move {
                if let Some(candidate) = candidate {
                    tracing::trace!("on ice candidate: {}", candidate);
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(ConnectionEvent::IceCandidate(init));
                        }
                        Err(err) => tracing::error!("failed to serialize ice candidate: {}", err),
                    }
                }
            }))
        })));

        peer.on_track(Box::new(enc!((events, remote_id)
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                Box::pin(enc!((events, remote_id) async move {
                    tracing::info!(
                        "track from {}: id={}, stream={}, kind={}",
                        remote_id,
                        track.id(),
                        track.stream_id(),
                        track.kind()
                    );
                    let _ = events.send(ConnectionEvent::Track(track));
                }))
            }
        )));

        peer.on_ice_connection_state_change(Box::new(enc!((events, remote_id)
            move |state: RTCIceConnectionState| {
                Box::pin(enc!((events, remote_id) async move {
                    tracing::debug!("ICE connection state with {} changed: {}", remote_id, state);
                    let _ = events.send(ConnectionEvent::IceConnectionStateChange(state));
                }))
            }
        )));

        peer.on_peer_connection_state_change(Box::new(enc!((events, remote_id)
            move |state: RTCPeerConnectionState| {
                Box::pin(enc!((events, remote_id) async move {
                    tracing::debug!("peer connection state with {} changed: {}", remote_id, state);
                    let _ = events.send(ConnectionEvent::PeerConnectionStateChange(state));
                }))
            }
        )));

        peer.on_ice_gathering_state_change(Box::new(move |state| {
            Box::pin(async move {
                tracing::debug!("ICE gathering state changed: {}", state);
            })
        }));
    }
}

#[async_trait]
impl PeerConnection for WebRTCPeerConnection {
    async fn create_offer(&self) -> Result<RTCSessionDescription, Error> {
        let offer = self.peer_connection.create_offer(None).await?;
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, Error> {
        let answer = self.peer_connection.create_answer(None).await?;
        Ok(answer)
    }

    async fn set_local_description(&self, sdp: RTCSessionDescription) -> Result<(), Error> {
        self.peer_connection.set_local_description(sdp).await?;
        Ok(())
    }

    async fn set_remote_description(&self, sdp: RTCSessionDescription) -> Result<(), Error> {
        self.peer_connection.set_remote_description(sdp).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<RTCSessionDescription> {
        self.peer_connection.local_description().await
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        self.peer_connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<(), Error> {
        let rtp_sender = self.peer_connection.add_track(track).await?;

        // Interceptors only run while inbound RTCP is being read.
        tokio::spawn(async move {
            while let Ok((_packets, _attr)) = rtp_sender.read_rtcp().await {}
            tracing::trace!("RTCP reader loop finished");
        });

        Ok(())
    }

    async fn add_receiver(&self, kind: RTPCodecType) -> Result<(), Error> {
        self.peer_connection
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

impl Drop for WebRTCPeerConnection {
    fn drop(&mut self) {
        tracing::debug!("WebRTCPeerConnection {} is dropped", self.id);
    }
}
