//! Peer connections backed by webrtc-rs.
//!
//! Local tracks are published as `TrackLocalStaticSample`s; the host's
//! capture pipeline writes encoded samples into them via
//! [`WebRtcPeerConnection::local_track`].

use super::{MediaError, MediaKind, MediaTrack, PeerConnection, PeerConnectionFactory, PeerEvent, PeerConnectionState};
use crate::config::{IceServer, MediaConfig};
use crate::protocol::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

const STREAM_ID: &str = "rtcall";

fn peer_error(e: webrtc::Error) -> MediaError {
    MediaError::PeerConnection(e.to_string())
}

fn sdp_error(e: webrtc::Error) -> MediaError {
    MediaError::Sdp(e.to_string())
}

fn rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => return None,
    })
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    let sdp = desc.sdp.clone();
    match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp).map_err(sdp_error),
        SdpType::Answer => RTCSessionDescription::answer(sdp).map_err(sdp_error),
    }
}

#[derive(Default)]
pub struct WebRtcPeerConnectionFactory;

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerConnectionFactory {
    async fn create_peer_connection(
        &self,
        config: &MediaConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(peer_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine).map_err(peer_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: rtc_ice_servers(&config.ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(peer_error)?);
        let (event_tx, event_rx) = mpsc::channel(64);

        let tx = event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!(target: "Media", "ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx
                            .send(PeerEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_m_line_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }))
                            .await;
                    }
                    Err(e) => warn!(target: "Media", "Could not serialize local candidate: {e}"),
                }
            })
        }));

        let tx = event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(state) = map_state(state) {
                    let _ = tx.send(PeerEvent::StateChanged(state)).await;
                }
            })
        }));

        let tx = event_tx;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Video => MediaKind::Video,
                        _ => MediaKind::Audio,
                    };
                    let _ = tx.send(PeerEvent::RemoteTrack { id: track.id(), kind }).await;
                })
            },
        ));

        let peer = WebRtcPeerConnection {
            pc,
            local_tracks: StdMutex::new(HashMap::new()),
        };
        Ok((Arc::new(peer), event_rx))
    }
}

pub struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    local_tracks: StdMutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
}

impl WebRtcPeerConnection {
    /// The outbound RTP track for a local capture track, for feeding samples.
    pub fn local_track(&self, id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), MediaError> {
        let mime_type = match track.kind() {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id().to_owned(),
            STREAM_ID.to_owned(),
        ));
        self.pc
            .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(peer_error)?;
        self.local_tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(track.id().to_owned(), local);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self.pc.create_offer(None).await.map_err(sdp_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self.pc.create_answer(None).await.map_err(sdp_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), MediaError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(sdp_error)
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), MediaError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(sdp_error)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| MediaError::Ice(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(target: "Media", "Error closing peer connection: {e}");
        }
    }
}
