//! In-memory stand-ins for the signaling server, media devices, and peer
//! connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::MediaConfig;
use crate::media::{
    CameraFacing, LocalStream, MediaConstraints, MediaDevices, MediaError, MediaKind, MediaTrack,
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent,
};
use crate::protocol::{IceCandidate, InboundMessage, OutboundMessage, SessionDescription};
use crate::session::SignalSender;
use crate::transport::{ConnectTarget, Transport, TransportEvent, TransportFactory};
use crate::types::CallId;

/// Lets every spawned task run until the runtime has nothing left to do
/// without advancing a paused clock.
pub(crate) async fn settle() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}

struct Link {
    id: u64,
    events: mpsc::Sender<TransportEvent>,
}

#[derive(Default)]
struct RelayState {
    unreachable: bool,
    next_link: u64,
    links: HashMap<String, Link>,
    dials: HashMap<String, usize>,
    sent: HashMap<String, Vec<OutboundMessage>>,
    /// call id -> (caller, receiver)
    calls: HashMap<CallId, (String, String)>,
}

impl RelayState {
    fn deliver(&self, user: &str, message: &InboundMessage) {
        let Some(link) = self.links.get(user) else {
            return;
        };
        if let Ok(text) = serde_json::to_string(message) {
            let _ = link.events.try_send(TransportEvent::TextReceived(text));
        }
    }

    fn other_party(&self, call_id: &CallId, from: &str) -> Option<String> {
        let (caller, receiver) = self.calls.get(call_id)?;
        Some(if caller == from { receiver.clone() } else { caller.clone() })
    }

    /// Relays call signaling the way the signaling server does: invites go to
    /// the receiver, everything else to the other party of the call.
    fn route(&mut self, from: &str, message: &OutboundMessage) {
        let inbound = match message {
            OutboundMessage::JoinRoom(_) | OutboundMessage::LeaveRoom(_) | OutboundMessage::HeartbeatAck {} => {
                return;
            }
            OutboundMessage::InitiateCall(invite) => {
                self.calls.insert(
                    invite.call_id.clone(),
                    (from.to_string(), invite.receiver_id.clone()),
                );
                self.deliver(&invite.receiver_id, &InboundMessage::IncomingCall(invite.clone()));
                return;
            }
            OutboundMessage::AcceptCall(r) => InboundMessage::CallAccepted(r.clone()),
            OutboundMessage::RejectCall(r) => InboundMessage::CallRejected(r.clone()),
            OutboundMessage::EndCall(r) => InboundMessage::CallEnded(r.clone()),
            OutboundMessage::WebrtcOffer(p) => InboundMessage::WebrtcOffer(p.clone()),
            OutboundMessage::WebrtcAnswer(p) => InboundMessage::WebrtcAnswer(p.clone()),
            OutboundMessage::WebrtcIceCandidate(p) => InboundMessage::WebrtcIceCandidate(p.clone()),
        };
        let Some(call_id) = message.call_id() else {
            return;
        };
        if let Some(to) = self.other_party(call_id, from) {
            self.deliver(&to, &inbound);
        }
    }
}

/// A signaling server that lives in the test process.
#[derive(Clone, Default)]
pub(crate) struct LoopbackServer {
    state: Arc<Mutex<RelayState>>,
}

impl LoopbackServer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap()
    }

    /// Transport factory that connects as `user`.
    pub(crate) fn factory(&self, user: &str) -> Arc<dyn TransportFactory> {
        Arc::new(LoopbackFactory {
            state: self.state.clone(),
            user: user.to_string(),
        })
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    pub(crate) fn dial_count(&self, user: &str) -> usize {
        self.lock().dials.get(user).copied().unwrap_or(0)
    }

    pub(crate) fn sent(&self, user: &str) -> Vec<OutboundMessage> {
        self.lock().sent.get(user).cloned().unwrap_or_default()
    }

    pub(crate) fn sent_names(&self, user: &str) -> Vec<&'static str> {
        self.sent(user).iter().map(OutboundMessage::name).collect()
    }

    pub(crate) fn join_count(&self, user: &str, room_id: &str) -> usize {
        self.sent(user)
            .iter()
            .filter(|m| matches!(m, OutboundMessage::JoinRoom(r) if r.room_id == room_id))
            .count()
    }

    pub(crate) fn clear_log(&self, user: &str) {
        self.lock().sent.remove(user);
    }

    /// Drops `user`'s link from the server side.
    pub(crate) fn drop_connection(&self, user: &str) {
        if let Some(link) = self.lock().links.remove(user) {
            let _ = link.events.try_send(TransportEvent::Disconnected);
        }
    }

    /// Delivers a raw text frame to `user`.
    pub(crate) fn push_raw(&self, user: &str, text: &str) {
        if let Some(link) = self.lock().links.get(user) {
            let _ = link
                .events
                .try_send(TransportEvent::TextReceived(text.to_string()));
        }
    }
}

struct LoopbackFactory {
    state: Arc<Mutex<RelayState>>,
    user: String,
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create_transport(
        &self,
        _target: &ConnectTarget,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let mut state = self.state.lock().unwrap();
        if state.unreachable {
            anyhow::bail!("connection refused");
        }
        *state.dials.entry(self.user.clone()).or_default() += 1;
        state.next_link += 1;
        let id = state.next_link;

        let (events, rx) = mpsc::channel(1024);
        let _ = events.try_send(TransportEvent::Connected);
        state.links.insert(self.user.clone(), Link { id, events });

        let transport = LoopbackTransport {
            state: self.state.clone(),
            user: self.user.clone(),
            link: id,
        };
        Ok((Arc::new(transport), rx))
    }
}

struct LoopbackTransport {
    state: Arc<Mutex<RelayState>>,
    user: String,
    link: u64,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send_text(&self, text: &str) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().unwrap();
        if state.links.get(&self.user).map(|l| l.id) != Some(self.link) {
            anyhow::bail!("link closed");
        }
        let message: OutboundMessage = serde_json::from_str(text)?;
        state
            .sent
            .entry(self.user.clone())
            .or_default()
            .push(message.clone());
        state.route(&self.user, &message);
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock().unwrap();
        if state.links.get(&self.user).map(|l| l.id) == Some(self.link) {
            state.links.remove(&self.user);
        }
    }
}

/// Records everything sent through it.
#[derive(Default)]
pub(crate) struct FakeSignal {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl FakeSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn sent_named(&self, name: &str) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.name() == name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SignalSender for FakeSignal {
    async fn send(&self, message: OutboundMessage) -> bool {
        self.sent.lock().unwrap().push(message);
        true
    }
}

pub(crate) struct FakeTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    facing: Mutex<CameraFacing>,
}

impl FakeTrack {
    fn new(id: String, kind: MediaKind) -> Self {
        Self {
            id,
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            facing: Mutex::new(CameraFacing::User),
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn set_facing(&self, facing: CameraFacing) -> Result<(), MediaError> {
        if self.kind != MediaKind::Video {
            return Err(MediaError::Unsupported("camera switching on an audio track"));
        }
        *self.facing.lock().unwrap() = facing;
        Ok(())
    }
}

pub(crate) struct FakeMediaDevices {
    available: AtomicBool,
    delay: Mutex<Option<Duration>>,
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
    acquisitions: AtomicUsize,
}

impl FakeMediaDevices {
    pub(crate) fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            delay: Mutex::new(None),
            tracks: Mutex::new(Vec::new()),
            acquisitions: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes every acquisition take `delay`.
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub(crate) fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.tracks.lock().unwrap().clone()
    }

    pub(crate) fn all_tracks_stopped(&self) -> bool {
        self.tracks().iter().all(|t| t.is_stopped())
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(MediaError::Unavailable("camera in use".into()));
        }
        let n = self.acquisitions.fetch_add(1, Ordering::SeqCst) + 1;

        let audio = Arc::new(FakeTrack::new(format!("audio-{n}"), MediaKind::Audio));
        let video = constraints
            .video
            .then(|| Arc::new(FakeTrack::new(format!("video-{n}"), MediaKind::Video)));

        let mut tracks = self.tracks.lock().unwrap();
        tracks.push(audio.clone());
        tracks.extend(video.clone());

        Ok(LocalStream {
            audio,
            video: video.map(|v| v as Arc<dyn MediaTrack>),
        })
    }
}

pub(crate) struct FakePeerFactory {
    auto_connect: bool,
    created: Mutex<Vec<Arc<FakePeerConnection>>>,
}

impl FakePeerFactory {
    /// With `auto_connect`, a peer reports `connected` as soon as it has both
    /// descriptions.
    pub(crate) fn new(auto_connect: bool) -> Self {
        Self {
            auto_connect,
            created: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn last(&self) -> Option<Arc<FakePeerConnection>> {
        self.created.lock().unwrap().last().cloned()
    }

    pub(crate) fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create_peer_connection(
        &self,
        _config: &MediaConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), MediaError> {
        let (events, rx) = mpsc::channel(64);
        let mut created = self.created.lock().unwrap();
        let peer = Arc::new(FakePeerConnection {
            index: created.len() + 1,
            auto_connect: self.auto_connect,
            events,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            tracks: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        created.push(peer.clone());
        Ok((peer, rx))
    }
}

pub(crate) struct FakePeerConnection {
    index: usize,
    auto_connect: bool,
    events: mpsc::Sender<PeerEvent>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    tracks: Mutex<Vec<String>>,
    applied: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
}

impl FakePeerConnection {
    pub(crate) fn emit(&self, event: PeerEvent) {
        let _ = self.events.try_send(event);
    }

    /// Ids of the local tracks added to this connection, in order.
    pub(crate) fn added_tracks(&self) -> Vec<String> {
        self.tracks.lock().unwrap().clone()
    }

    pub(crate) fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied.lock().unwrap().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn maybe_connect(&self) {
        let ready = self.local.lock().unwrap().is_some() && self.remote.lock().unwrap().is_some();
        if self.auto_connect && ready {
            self.emit(PeerEvent::StateChanged(PeerConnectionState::Connecting));
            self.emit(PeerEvent::StateChanged(PeerConnectionState::Connected));
            self.emit(PeerEvent::RemoteTrack {
                id: format!("remote-audio-{}", self.index),
                kind: MediaKind::Audio,
            });
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), MediaError> {
        self.tracks.lock().unwrap().push(track.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription::offer(format!("v=0 o=fake-{} offer", self.index)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        if self.remote.lock().unwrap().is_none() {
            return Err(MediaError::Sdp("no remote offer".into()));
        }
        Ok(SessionDescription::answer(format!("v=0 o=fake-{} answer", self.index)))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), MediaError> {
        *self.local.lock().unwrap() = Some(desc.clone());
        self.emit(PeerEvent::LocalCandidate(
            IceCandidate::new(format!(
                "candidate:{0} 1 udp 2122260223 10.0.0.{0} 50000 typ host",
                self.index
            ))
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0),
        ));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), MediaError> {
        *self.remote.lock().unwrap() = Some(desc.clone());
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        if self.remote.lock().unwrap().is_none() {
            return Err(MediaError::Ice("remote description not set".into()));
        }
        self.applied.lock().unwrap().push(candidate.clone());
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.emit(PeerEvent::StateChanged(PeerConnectionState::Closed));
        }
    }
}
