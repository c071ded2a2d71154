use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::internal::data_types::ConnectivityState;
use crate::internal::events::TransportEvent;
use crate::internal::transport::{MediaTransport, TransportEventSink, TransportFactory};
use crate::media::LocalTrack;
use crate::signaling::{IceCandidate, SessionDescription};
use crate::PeerId;

/// Builds webrtc-rs peer connections.
pub struct RtcTransportFactory {
    ice_servers: Vec<String>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        remote: &PeerId,
        events: TransportEventSink,
    ) -> Result<Box<dyn MediaTransport>> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        // every peer connection needs its own MediaEngine and interceptor registry
        let api = create_api()?;
        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        // send discovered ice candidates (for self) to remote peer
        let sink = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                if let Some(candidate) = c {
                    match candidate.to_json() {
                        Ok(init) => sink.emit(TransportEvent::LocalCandidate(init.into())),
                        Err(e) => log::error!(
                            "failed to serialize ice candidate for {}: {}",
                            sink.peer(),
                            e
                        ),
                    }
                }
            })
        }));

        let sink = events.clone();
        peer_connection.on_ice_connection_state_change(Box::new(
            move |connection_state: RTCIceConnectionState| {
                log::info!(
                    "Connection State for peer {} has changed {}",
                    sink.peer(),
                    connection_state
                );
                if let Some(state) = connectivity(connection_state) {
                    sink.emit(TransportEvent::Connectivity(state));
                }
                Box::pin(async {})
            },
        ));

        let sink = events;
        peer_connection.on_track(Box::new(
            move |track: Option<Arc<TrackRemote>>, _receiver: Option<Arc<RTCRtpReceiver>>| {
                if let Some(track) = track {
                    sink.emit(TransportEvent::RemoteTrack(track));
                }
                Box::pin(async {})
            },
        ));

        log::debug!("created peer connection for {}", remote);
        Ok(Box::new(RtcTransport { peer_connection }))
    }
}

struct RtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaTransport for RtcTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let rtp_sender = self
            .peer_connection
            .add_track(Arc::clone(&track.rtp) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        // RTCP packets have to be read for interceptors (NACK and friends) to work
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtp_sender.read(&mut rtcp_buf).await {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await?;
        // Sets the LocalDescription, and starts our UDP listeners
        // Note: this will start the gathering of ICE candidates
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;
        to_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await?;
        to_description(&answer)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc: RTCSessionDescription = serde_json::from_value(serde_json::to_value(desc)?)?;
        self.peer_connection.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(candidate.into())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

fn to_description(desc: &RTCSessionDescription) -> Result<SessionDescription> {
    Ok(serde_json::from_value(serde_json::to_value(desc)?)?)
}

fn connectivity(state: RTCIceConnectionState) -> Option<ConnectivityState> {
    let state = match state {
        RTCIceConnectionState::New => ConnectivityState::New,
        RTCIceConnectionState::Checking => ConnectivityState::Checking,
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            ConnectivityState::Connected
        }
        RTCIceConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCIceConnectionState::Failed => ConnectivityState::Failed,
        RTCIceConnectionState::Closed => ConnectivityState::Closed,
        _ => return None,
    };
    Some(state)
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

fn create_api() -> Result<webrtc::api::API> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;

    // This provides NACKs, RTCP Reports and other features.
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media)?;

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}
