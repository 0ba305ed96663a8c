//! Media Negotiation Engine.
//!
//! The engine never talks to devices or a WebRTC stack directly: local
//! capture goes through [`MediaDevices`] and peer connections through
//! [`PeerConnectionFactory`]. Production builds plug in the `webrtc` backend,
//! tests plug in fakes.

pub mod engine;
pub mod error;
pub mod state;
#[cfg(feature = "webrtc")]
pub mod webrtc;

pub use engine::{NegotiationEngine, NegotiationEvent};
pub use error::MediaError;
pub use state::{NegotiationRole, NegotiationState, PeerConnectionState};

use crate::config::MediaConfig;
use crate::protocol::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    #[default]
    User,
    Environment,
}

impl CameraFacing {
    pub fn toggled(self) -> Self {
        match self {
            Self::User => Self::Environment,
            Self::Environment => Self::User,
        }
    }
}

/// A local capture track.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn is_enabled(&self) -> bool;
    /// Disabling keeps the track negotiated but sends silence or black frames.
    fn set_enabled(&self, enabled: bool);
    fn stop(&self);

    /// Re-targets a video track at another camera.
    fn set_facing(&self, _facing: CameraFacing) -> Result<(), MediaError> {
        Err(MediaError::Unsupported("camera switching"))
    }
}

pub struct LocalStream {
    pub audio: Arc<dyn MediaTrack>,
    pub video: Option<Arc<dyn MediaTrack>>,
}

impl LocalStream {
    pub fn tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        let mut tracks = vec![self.audio.clone()];
        tracks.extend(self.video.clone());
        tracks
    }

    pub fn stop(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("audio", &self.audio.id())
            .field("video", &self.video.as_ref().map(|v| v.id().to_string()))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub facing: CameraFacing,
}

impl MediaConstraints {
    pub fn for_call(wants_video: bool) -> Self {
        Self {
            audio: true,
            video: wants_video,
            facing: CameraFacing::User,
        }
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError>;
}

/// Callbacks from a peer connection, delivered over a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    StateChanged(PeerConnectionState),
    RemoteTrack { id: String, kind: MediaKind },
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), MediaError>;
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), MediaError>;
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), MediaError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create_peer_connection(
        &self,
        config: &MediaConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), MediaError>;
}
