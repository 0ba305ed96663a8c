use super::{CameraFacing, LocalStream, MediaKind, PeerConnection};
use crate::protocol::{IceCandidate, SessionDescription};
use crate::types::CallId;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NegotiationRole {
    /// Caller side: creates the offer once the callee accepts.
    Offerer,
    /// Callee side: answers the caller's offer.
    Answerer,
}

/// Mirror of the underlying peer connection's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PeerConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    /// Transient; ICE may still recover.
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Per-call negotiation state. At most one exists at a time.
pub struct NegotiationState {
    pub(crate) call_id: CallId,
    pub(crate) role: NegotiationRole,
    pub(crate) epoch: u64,
    pub(crate) wants_video: bool,
    pub(crate) local_stream: Option<LocalStream>,
    pub(crate) peer: Option<Arc<dyn PeerConnection>>,
    pub(crate) remote_description_set: bool,
    /// An offer that arrived before the peer connection existed.
    pub(crate) pending_offer: Option<SessionDescription>,
    /// Remote candidates that arrived before the remote description, in order.
    pub(crate) pending_candidates: Vec<IceCandidate>,
    pub(crate) remote_tracks: Vec<RemoteTrack>,
    pub(crate) connection_state: PeerConnectionState,
    pub(crate) facing: CameraFacing,
}

impl NegotiationState {
    pub(crate) fn new(call_id: CallId, role: NegotiationRole, wants_video: bool, epoch: u64) -> Self {
        Self {
            call_id,
            role,
            epoch,
            wants_video,
            local_stream: None,
            peer: None,
            remote_description_set: false,
            pending_offer: None,
            pending_candidates: Vec::new(),
            remote_tracks: Vec::new(),
            connection_state: PeerConnectionState::New,
            facing: CameraFacing::User,
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.connection_state
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Candidates can be applied only once a peer exists and has a remote description.
    pub(crate) fn ready_for_candidates(&self) -> bool {
        self.peer.is_some() && self.remote_description_set
    }

    /// Stops every local track and closes the peer connection.
    pub(crate) async fn release(self) {
        if let Some(stream) = self.local_stream {
            stream.stop();
        }
        if let Some(peer) = self.peer {
            peer.close().await;
        }
    }
}
