use super::state::{NegotiationRole, NegotiationState, PeerConnectionState, RemoteTrack};
use super::{
    CameraFacing, LocalStream, MediaConstraints, MediaDevices, MediaError, MediaKind,
    PeerConnection, PeerConnectionFactory, PeerEvent,
};
use crate::config::MediaConfig;
use crate::protocol::{AnswerPayload, IceCandidate, IcePayload, OfferPayload, OutboundMessage, SessionDescription};
use crate::session::SignalSender;
use crate::types::CallId;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};

/// What the engine reports back to the call coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    /// The peer connection reached `connected`.
    Connected { call_id: CallId },
    /// The peer connection failed or closed on its own.
    ConnectionLost { call_id: CallId },
    RemoteTrackAdded {
        call_id: CallId,
        track_id: String,
        kind: MediaKind,
    },
}

/// Drives SDP offer/answer and ICE exchange for the single active call.
///
/// Every negotiation carries an epoch. [`NegotiationEngine::stop`] bumps the
/// epoch, so work that was in flight when the call ended notices on its next
/// check and releases whatever it acquired instead of installing it.
pub struct NegotiationEngine {
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    signaling: Arc<dyn SignalSender>,
    config: MediaConfig,
    state: Mutex<Option<NegotiationState>>,
    epoch: AtomicU64,
    event_tx: mpsc::UnboundedSender<NegotiationEvent>,
}

impl NegotiationEngine {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
        signaling: Arc<dyn SignalSender>,
        config: MediaConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<NegotiationEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            devices,
            peers,
            signaling,
            config,
            state: Mutex::new(None),
            epoch: AtomicU64::new(0),
            event_tx,
        });
        (engine, event_rx)
    }

    /// Acquires local media, creates the peer connection and, for the
    /// offerer, sends the offer. Any earlier negotiation is torn down first.
    pub async fn start(
        self: &Arc<Self>,
        call_id: CallId,
        role: NegotiationRole,
        wants_video: bool,
    ) -> Result<(), MediaError> {
        let epoch = self.begin(call_id, role, wants_video).await;
        self.establish(epoch).await
    }

    /// Installs the per-call state without awaiting devices, so signaling for
    /// the call that races ahead of [`Self::establish`] is buffered rather
    /// than dropped.
    pub(crate) async fn begin(&self, call_id: CallId, role: NegotiationRole, wants_video: bool) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self
            .state
            .lock()
            .await
            .replace(NegotiationState::new(call_id.clone(), role, wants_video, epoch));
        if let Some(previous) = previous {
            warn!(target: "Media", "Replacing negotiation for {} with {call_id}", previous.call_id);
            previous.release().await;
        }
        debug!(target: "Media", "Negotiation for {call_id} begins as {role:?} (epoch {epoch})");
        epoch
    }

    pub(crate) async fn establish(self: &Arc<Self>, epoch: u64) -> Result<(), MediaError> {
        let (call_id, wants_video) = {
            let guard = self.state.lock().await;
            match guard.as_ref() {
                Some(state) if state.epoch == epoch => (state.call_id.clone(), state.wants_video),
                _ => return Err(MediaError::Cancelled),
            }
        };

        let (stream, peer, events) = match self.acquire_and_connect(wants_video).await {
            Ok(parts) => parts,
            Err(e) => {
                warn!(target: "Media", "Could not set up media for {call_id}: {e}");
                self.discard(epoch).await;
                return Err(e);
            }
        };

        let mut guard = self.state.lock().await;
        let Some(state) = guard.as_mut().filter(|s| s.epoch == epoch) else {
            drop(guard);
            debug!(target: "Media", "Negotiation for {call_id} was stopped during setup, releasing media");
            stream.stop();
            peer.close().await;
            return Err(MediaError::Cancelled);
        };

        state.local_stream = Some(stream);
        state.peer = Some(peer.clone());
        state.connection_state = PeerConnectionState::New;

        let engine = self.clone();
        let pump_call_id = call_id.clone();
        tokio::spawn(async move { engine.pump_peer_events(epoch, pump_call_id, events).await });

        let outcome = match state.role {
            NegotiationRole::Offerer => self.send_offer(&call_id, peer.as_ref()).await,
            NegotiationRole::Answerer => match state.pending_offer.take() {
                Some(offer) => self.apply_offer(state, offer).await,
                None => Ok(()),
            },
        };

        if let Err(e) = &outcome {
            warn!(target: "Media", "Negotiation for {call_id} failed: {e}");
            if let Some(state) = guard.take() {
                state.release().await;
            }
        }
        outcome
    }

    async fn acquire_and_connect(
        &self,
        wants_video: bool,
    ) -> Result<(LocalStream, Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), MediaError> {
        let stream = self.devices.acquire(&MediaConstraints::for_call(wants_video)).await?;
        let stream = scopeguard::guard(stream, |stream| stream.stop());

        let (peer, events) = self.peers.create_peer_connection(&self.config).await?;
        for track in stream.tracks() {
            if let Err(e) = peer.add_track(track).await {
                peer.close().await;
                return Err(e);
            }
        }
        Ok((scopeguard::ScopeGuard::into_inner(stream), peer, events))
    }

    async fn send_offer(&self, call_id: &CallId, peer: &dyn PeerConnection) -> Result<(), MediaError> {
        let offer = peer.create_offer().await?;
        peer.set_local_description(&offer).await?;
        let sent = self
            .signaling
            .send(OutboundMessage::WebrtcOffer(OfferPayload {
                call_id: call_id.clone(),
                offer,
            }))
            .await;
        if sent {
            info!(target: "Media", "Sent offer for {call_id}");
        } else {
            warn!(target: "Media", "Offer for {call_id} was not delivered");
        }
        Ok(())
    }

    async fn apply_offer(
        &self,
        state: &mut NegotiationState,
        offer: SessionDescription,
    ) -> Result<(), MediaError> {
        let Some(peer) = state.peer.clone() else {
            state.pending_offer = Some(offer);
            return Ok(());
        };
        peer.set_remote_description(&offer).await?;
        state.remote_description_set = true;
        Self::flush_pending_candidates(state, peer.as_ref()).await;

        let answer = peer.create_answer().await?;
        peer.set_local_description(&answer).await?;
        let sent = self
            .signaling
            .send(OutboundMessage::WebrtcAnswer(AnswerPayload {
                call_id: state.call_id.clone(),
                answer,
            }))
            .await;
        if sent {
            info!(target: "Media", "Sent answer for {}", state.call_id);
        } else {
            warn!(target: "Media", "Answer for {} was not delivered", state.call_id);
        }
        Ok(())
    }

    async fn flush_pending_candidates(state: &mut NegotiationState, peer: &dyn PeerConnection) {
        let pending = std::mem::take(&mut state.pending_candidates);
        if pending.is_empty() {
            return;
        }
        debug!(target: "Media", "Applying {} buffered candidate(s) for {}", pending.len(), state.call_id);
        for candidate in &pending {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!(target: "Media", "Failed to apply buffered candidate: {e}");
            }
        }
    }

    /// Answerer side. An offer that beats local setup is held until the peer
    /// connection exists.
    pub async fn handle_offer(&self, call_id: &CallId, offer: SessionDescription) -> Result<(), MediaError> {
        let mut guard = self.state.lock().await;
        let Some(state) = guard.as_mut().filter(|s| &s.call_id == call_id) else {
            debug!(target: "Media", "Ignoring offer for inactive call {call_id}");
            return Ok(());
        };
        if state.role != NegotiationRole::Answerer {
            warn!(target: "Media", "Ignoring offer for {call_id}: we are the offerer");
            return Ok(());
        }
        if state.remote_description_set {
            debug!(target: "Media", "Ignoring duplicate offer for {call_id}");
            return Ok(());
        }
        if state.peer.is_none() {
            debug!(target: "Media", "Holding offer for {call_id} until local media is ready");
            state.pending_offer = Some(offer);
            return Ok(());
        }
        self.apply_offer(state, offer).await
    }

    /// Offerer side.
    pub async fn handle_answer(&self, call_id: &CallId, answer: SessionDescription) -> Result<(), MediaError> {
        let mut guard = self.state.lock().await;
        let Some(state) = guard.as_mut().filter(|s| &s.call_id == call_id) else {
            debug!(target: "Media", "Ignoring answer for inactive call {call_id}");
            return Ok(());
        };
        if state.role != NegotiationRole::Offerer {
            warn!(target: "Media", "Ignoring answer for {call_id}: we are the answerer");
            return Ok(());
        }
        if state.remote_description_set {
            debug!(target: "Media", "Ignoring duplicate answer for {call_id}");
            return Ok(());
        }
        let Some(peer) = state.peer.clone() else {
            warn!(target: "Media", "Answer for {call_id} arrived before an offer was made");
            return Ok(());
        };
        peer.set_remote_description(&answer).await?;
        state.remote_description_set = true;
        Self::flush_pending_candidates(state, peer.as_ref()).await;
        Ok(())
    }

    /// Applies a remote candidate, or queues it until the remote description
    /// is in place. Failures are logged and never end the call.
    pub async fn handle_ice_candidate(&self, call_id: &CallId, candidate: IceCandidate) {
        let mut guard = self.state.lock().await;
        let Some(state) = guard.as_mut().filter(|s| &s.call_id == call_id) else {
            debug!(target: "Media", "Ignoring candidate for inactive call {call_id}");
            return;
        };
        if !state.ready_for_candidates() {
            state.pending_candidates.push(candidate);
            return;
        }
        if let Some(peer) = state.peer.clone()
            && let Err(e) = peer.add_ice_candidate(&candidate).await
        {
            warn!(target: "Media", "Failed to apply candidate for {call_id}: {e}");
        }
    }

    /// Returns `true` when the microphone is now muted.
    pub async fn toggle_mute(&self) -> Result<bool, MediaError> {
        let guard = self.state.lock().await;
        let stream = guard
            .as_ref()
            .and_then(|s| s.local_stream.as_ref())
            .ok_or(MediaError::NoActiveSession)?;
        let enabled = !stream.audio.is_enabled();
        stream.audio.set_enabled(enabled);
        Ok(!enabled)
    }

    /// Returns `true` when the camera is now off.
    pub async fn toggle_video(&self) -> Result<bool, MediaError> {
        let guard = self.state.lock().await;
        let stream = guard
            .as_ref()
            .and_then(|s| s.local_stream.as_ref())
            .ok_or(MediaError::NoActiveSession)?;
        let video = stream.video.as_ref().ok_or(MediaError::NoVideoTrack)?;
        let enabled = !video.is_enabled();
        video.set_enabled(enabled);
        Ok(!enabled)
    }

    pub async fn switch_camera(&self) -> Result<CameraFacing, MediaError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(MediaError::NoActiveSession)?;
        let stream = state.local_stream.as_ref().ok_or(MediaError::NoActiveSession)?;
        let video = stream.video.as_ref().ok_or(MediaError::NoVideoTrack)?;
        let facing = state.facing.toggled();
        video.set_facing(facing)?;
        state.facing = facing;
        Ok(facing)
    }

    /// Tears down the active negotiation, if any. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await.take();
        if let Some(state) = state {
            info!(target: "Media", "Stopping negotiation for {}", state.call_id);
            state.release().await;
        }
    }

    pub async fn active_call(&self) -> Option<CallId> {
        self.state.lock().await.as_ref().map(|s| s.call_id.clone())
    }

    pub async fn connection_state(&self) -> Option<PeerConnectionState> {
        self.state.lock().await.as_ref().map(|s| s.connection_state)
    }

    pub async fn pending_candidate_count(&self) -> usize {
        self.state
            .lock()
            .await
            .as_ref()
            .map_or(0, NegotiationState::pending_candidate_count)
    }

    async fn discard(&self, epoch: u64) {
        let mut guard = self.state.lock().await;
        if guard.as_ref().is_some_and(|s| s.epoch == epoch)
            && let Some(state) = guard.take()
        {
            state.release().await;
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn emit(&self, event: NegotiationEvent) {
        if self.event_tx.send(event).is_err() {
            debug!(target: "Media", "Negotiation event receiver is gone");
        }
    }

    async fn pump_peer_events(
        self: Arc<Self>,
        epoch: u64,
        call_id: CallId,
        mut events: mpsc::Receiver<PeerEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if !self.is_current(epoch) {
                debug!(target: "Media", "Dropping {event:?} from a stopped negotiation");
                break;
            }
            match event {
                PeerEvent::LocalCandidate(candidate) => {
                    let sent = self
                        .signaling
                        .send(OutboundMessage::WebrtcIceCandidate(IcePayload {
                            call_id: call_id.clone(),
                            candidate,
                        }))
                        .await;
                    if !sent {
                        debug!(target: "Media", "Local candidate for {call_id} not delivered");
                    }
                }
                PeerEvent::StateChanged(peer_state) => {
                    self.on_peer_state(epoch, &call_id, peer_state).await;
                }
                PeerEvent::RemoteTrack { id, kind } => {
                    {
                        let mut guard = self.state.lock().await;
                        match guard.as_mut().filter(|s| s.epoch == epoch) {
                            Some(state) => state.remote_tracks.push(RemoteTrack {
                                id: id.clone(),
                                kind,
                            }),
                            None => break,
                        }
                    }
                    info!(target: "Media", "Remote {kind:?} track {id} added for {call_id}");
                    self.emit(NegotiationEvent::RemoteTrackAdded {
                        call_id: call_id.clone(),
                        track_id: id,
                        kind,
                    });
                }
            }
        }
        debug!(target: "Media", "Peer event pump for {call_id} finished");
    }

    async fn on_peer_state(&self, epoch: u64, call_id: &CallId, peer_state: PeerConnectionState) {
        {
            let mut guard = self.state.lock().await;
            let Some(state) = guard.as_mut().filter(|s| s.epoch == epoch) else {
                return;
            };
            if state.connection_state == peer_state {
                return;
            }
            state.connection_state = peer_state;
        }
        debug!(target: "Media", "Peer connection for {call_id} is {peer_state:?}");

        match peer_state {
            PeerConnectionState::Connected => {
                self.emit(NegotiationEvent::Connected {
                    call_id: call_id.clone(),
                });
            }
            PeerConnectionState::Disconnected => {
                info!(target: "Media", "Peer connection for {call_id} interrupted, waiting for ICE to recover");
            }
            s if s.is_terminal() => {
                warn!(target: "Media", "Peer connection for {call_id} is {s:?}");
                self.emit(NegotiationEvent::ConnectionLost {
                    call_id: call_id.clone(),
                });
            }
            _ => {}
        }
    }
}
