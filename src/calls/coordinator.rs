//! Call Lifecycle Coordinator.
//!
//! A single task owns the current [`CallSession`]. Commands from the
//! [`CallHandle`], inbound signaling, negotiation events, and timer expiries
//! are all serialized through its select loop, so the call state has exactly
//! one writer.

use super::error::CallError;
use super::state::{CallSession, CallState, CallTransition};
use crate::config::CallConfig;
use crate::media::{CameraFacing, MediaError, NegotiationEngine, NegotiationEvent, NegotiationRole};
use crate::protocol::{CallInvite, CallRef, CallRejection, InboundMessage, OutboundMessage, RejectReason};
use crate::session::TransportSession;
use crate::types::{CallEvent, CallId, CallKind, EndReason, Party};
use log::{debug, info, warn};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    Initiate {
        peer_id: String,
        kind: CallKind,
        reply: Reply<CallId>,
    },
    Accept {
        reply: Reply<()>,
    },
    Reject {
        reply: Reply<()>,
    },
    End {
        reply: Reply<()>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Ring,
    Connect,
}

/// Continuations of work the coordinator spawned. Each is tagged with the
/// call generation it belongs to and is dropped if that call is gone.
enum Internal {
    TimerFired {
        generation: u64,
        kind: TimerKind,
    },
    MediaStarted {
        generation: u64,
        result: Result<(), MediaError>,
    },
}

/// Cheap, cloneable front end to the coordinator task.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CallEvent>,
    snapshot: Arc<RwLock<Option<CallSession>>>,
    engine: Arc<NegotiationEngine>,
}

impl CallHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| CallError::Stopped)?;
        rx.await.map_err(|_| CallError::Stopped)?
    }

    /// Invites `peer_id`. Only legal while idle.
    pub async fn initiate_call(&self, peer_id: impl Into<String>, kind: CallKind) -> Result<CallId, CallError> {
        let peer_id = peer_id.into();
        self.request(|reply| Command::Initiate { peer_id, kind, reply })
            .await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    /// Declines a ringing incoming call; from any other state it hangs up.
    /// A no-op when there is no call.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await
    }

    /// Hangs up from any non-terminal state. A no-op when there is no call.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await
    }

    /// Returns `true` when the microphone is now muted.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.engine.toggle_mute().await.map_err(media_control_error)
    }

    /// Returns `true` when the camera is now off.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.engine.toggle_video().await.map_err(media_control_error)
    }

    pub async fn switch_camera(&self) -> Result<CameraFacing, CallError> {
        self.engine.switch_camera().await.map_err(media_control_error)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the current call, `None` when idle.
    pub fn current_call(&self) -> Option<CallSession> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Ends any current call and stops the coordinator task.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

fn media_control_error(e: MediaError) -> CallError {
    match e {
        MediaError::NoActiveSession => CallError::NoCall,
        other => CallError::Media(other),
    }
}

pub struct CallCoordinator {
    identity: Party,
    config: CallConfig,
    session: Arc<TransportSession>,
    engine: Arc<NegotiationEngine>,

    current: Option<CallSession>,
    /// Bumped whenever a call is created or finished.
    generation: u64,
    timer: Option<JoinHandle<()>>,

    events: broadcast::Sender<CallEvent>,
    snapshot: Arc<RwLock<Option<CallSession>>>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl CallCoordinator {
    /// Spawns the coordinator task for the user `identity` and returns its handle.
    pub fn start(
        identity: Party,
        session: Arc<TransportSession>,
        engine: Arc<NegotiationEngine>,
        negotiation_events: mpsc::UnboundedReceiver<NegotiationEvent>,
        config: CallConfig,
    ) -> CallHandle {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(RwLock::new(None));
        let inbound = session.subscribe();

        let coordinator = Self {
            identity,
            config,
            session,
            engine: engine.clone(),
            current: None,
            generation: 0,
            timer: None,
            events: events.clone(),
            snapshot: snapshot.clone(),
            internal_tx,
        };
        tokio::spawn(coordinator.run(command_rx, inbound, negotiation_events, internal_rx));

        CallHandle {
            commands: command_tx,
            events,
            snapshot,
            engine,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbound: broadcast::Receiver<Arc<InboundMessage>>,
        mut negotiation: mpsc::UnboundedReceiver<NegotiationEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        info!(target: "Calls", "Call coordinator started for {}", self.identity.id);
        let mut done = None;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { done: tx }) => {
                        done = Some(tx);
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                message = inbound.recv() => match message {
                    Ok(message) => self.handle_inbound(&message).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "Calls", "Inbound signaling lagged, skipped {skipped} message(s)");
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(event) = negotiation.recv() => self.handle_negotiation(event).await,
                Some(event) = internal.recv() => self.handle_internal(event).await,
            }
        }

        if self.current.is_some() {
            self.send_end_call().await;
            self.finish(EndReason::Hangup).await;
        }
        info!(target: "Calls", "Call coordinator stopped.");
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initiate {
                peer_id,
                kind,
                reply,
            } => {
                let _ = reply.send(self.initiate(peer_id, kind).await);
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.accept().await);
            }
            Command::Reject { reply } => {
                let _ = reply.send(self.reject().await);
            }
            Command::End { reply } => {
                let _ = reply.send(self.end().await);
            }
            Command::Shutdown { .. } => {}
        }
    }

    async fn initiate(&mut self, peer_id: String, kind: CallKind) -> Result<CallId, CallError> {
        if let Some(call) = &self.current {
            return Err(CallError::Busy(call.call_id.to_string()));
        }

        let call = CallSession::new_outgoing(CallId::generate(), self.identity.clone(), peer_id, kind);
        let call_id = call.call_id.clone();
        if !self
            .session
            .send(OutboundMessage::InitiateCall(call.invite()))
            .await
        {
            warn!(target: "Calls", "Invite for {call_id} was not delivered");
            return Err(CallError::NotConnected);
        }

        info!(target: "Calls", "Calling {} ({kind:?}), call {call_id}", call.callee_id);
        self.install(call);
        self.arm_timer(TimerKind::Ring, self.config.ring_timeout);
        Ok(call_id)
    }

    async fn accept(&mut self) -> Result<(), CallError> {
        let call = self.current.as_mut().ok_or(CallError::NoCall)?;
        if !call.state.can_accept() {
            return Err(CallError::InvalidState(call.state.name()));
        }
        call.apply_transition(CallTransition::LocalAccepted)?;
        let call_id = call.call_id.clone();
        let wants_video = call.kind.wants_video();

        self.cancel_timer();
        self.publish_snapshot();
        if !self
            .session
            .send(OutboundMessage::AcceptCall(CallRef {
                call_id: call_id.clone(),
            }))
            .await
        {
            warn!(target: "Calls", "Accept for {call_id} was not delivered");
        }
        info!(target: "Calls", "Accepted call {call_id}");
        self.emit(CallEvent::CallAccepted {
            call_id: call_id.clone(),
        });

        self.start_negotiation(call_id, NegotiationRole::Answerer, wants_video)
            .await;
        Ok(())
    }

    async fn reject(&mut self) -> Result<(), CallError> {
        let Some(call) = &self.current else {
            debug!(target: "Calls", "reject_call with no current call; ignoring");
            return Ok(());
        };
        if !call.state.can_reject() {
            debug!(target: "Calls", "reject_call in {} cancels call {}", call.state.name(), call.call_id);
            self.send_end_call().await;
            self.finish(EndReason::Hangup).await;
            return Ok(());
        }
        let call_id = call.call_id.clone();
        self.send_reject(&call_id, RejectReason::Declined).await;
        self.finish(EndReason::Rejected).await;
        Ok(())
    }

    async fn end(&mut self) -> Result<(), CallError> {
        if self.current.is_none() {
            debug!(target: "Calls", "end_call with no current call; ignoring");
            return Ok(());
        }
        self.send_end_call().await;
        self.finish(EndReason::Hangup).await;
        Ok(())
    }

    async fn handle_inbound(&mut self, message: &InboundMessage) {
        match message {
            InboundMessage::Heartbeat {} => {}
            InboundMessage::IncomingCall(invite) => self.on_invite(invite).await,
            InboundMessage::CallAccepted(r) => {
                let Some(call) = self.matching_call(&r.call_id) else {
                    return;
                };
                if !matches!(call.state, CallState::OutgoingRinging { .. }) {
                    debug!(target: "Calls", "Ignoring call_accepted for {} in {}", r.call_id, call.state.name());
                    return;
                }
                if let Err(e) = call.apply_transition(CallTransition::RemoteAccepted) {
                    warn!(target: "Calls", "{e}");
                    return;
                }
                let wants_video = call.kind.wants_video();
                self.cancel_timer();
                self.publish_snapshot();
                info!(target: "Calls", "Call {} accepted by peer", r.call_id);
                self.emit(CallEvent::CallAccepted {
                    call_id: r.call_id.clone(),
                });
                self.start_negotiation(r.call_id.clone(), NegotiationRole::Offerer, wants_video)
                    .await;
            }
            InboundMessage::CallRejected(rejection) => self.on_remote_reject(rejection).await,
            InboundMessage::CallEnded(r) => {
                let Some(call) = self.matching_call(&r.call_id) else {
                    return;
                };
                // A caller giving up before we answered is a missed call here too.
                let reason = match call.state {
                    CallState::IncomingRinging { .. } => EndReason::Timeout,
                    _ => EndReason::RemoteHangup,
                };
                info!(target: "Calls", "Peer ended call {} ({reason:?})", r.call_id);
                self.finish(reason).await;
            }
            InboundMessage::WebrtcOffer(p) => {
                if self.matching_call(&p.call_id).is_some() {
                    let result = self.engine.handle_offer(&p.call_id, p.offer.clone()).await;
                    self.on_negotiation_result(result).await;
                }
            }
            InboundMessage::WebrtcAnswer(p) => {
                if self.matching_call(&p.call_id).is_some() {
                    let result = self.engine.handle_answer(&p.call_id, p.answer.clone()).await;
                    self.on_negotiation_result(result).await;
                }
            }
            InboundMessage::WebrtcIceCandidate(p) => {
                if self.matching_call(&p.call_id).is_some() {
                    self.engine
                        .handle_ice_candidate(&p.call_id, p.candidate.clone())
                        .await;
                }
            }
        }
    }

    async fn on_invite(&mut self, invite: &CallInvite) {
        if invite.caller_id == self.identity.id {
            debug!(target: "Calls", "Ignoring echo of our own invite {}", invite.call_id);
            return;
        }
        if let Some(current) = &self.current {
            if current.call_id == invite.call_id {
                debug!(target: "Calls", "Duplicate invite for {}", invite.call_id);
                return;
            }
            info!(
                target: "Calls",
                "Busy with {}, auto-rejecting invite {} from {}",
                current.call_id, invite.call_id, invite.caller_id
            );
            let reason = self.config.send_busy_reason.then_some(RejectReason::Busy);
            let rejection = OutboundMessage::RejectCall(CallRejection {
                call_id: invite.call_id.clone(),
                reason,
            });
            if !self.session.send(rejection).await {
                warn!(target: "Calls", "Busy rejection for {} was not delivered", invite.call_id);
            }
            return;
        }

        let call = CallSession::new_incoming(invite);
        info!(
            target: "Calls",
            "Incoming {:?} call {} from {}",
            call.kind, call.call_id, call.caller.id
        );
        self.install(call.clone());
        self.arm_timer(TimerKind::Ring, self.config.ring_timeout);
        self.emit(CallEvent::IncomingCall(call));
    }

    async fn on_remote_reject(&mut self, rejection: &CallRejection) {
        let Some(call) = self.matching_call(&rejection.call_id) else {
            return;
        };
        let state = call.state.clone();
        match state {
            CallState::OutgoingRinging { .. } => {}
            CallState::Connecting { .. } | CallState::Active { .. } => {
                info!(target: "Calls", "Peer rejected call {} after accepting, ending it", rejection.call_id);
                self.finish(EndReason::RemoteHangup).await;
                return;
            }
            _ => {
                debug!(target: "Calls", "Ignoring call_rejected for {} in {}", rejection.call_id, state.name());
                return;
            }
        }
        let reason = match rejection.reason {
            Some(RejectReason::Busy) => EndReason::Busy,
            Some(RejectReason::Timeout) => EndReason::Timeout,
            Some(RejectReason::Declined) | None => EndReason::RemoteRejected,
        };
        info!(target: "Calls", "Call {} rejected by peer ({reason:?})", rejection.call_id);
        self.finish(reason).await;
    }

    async fn on_negotiation_result(&mut self, result: Result<(), MediaError>) {
        match result {
            Ok(()) | Err(MediaError::Cancelled) => {}
            Err(e) => {
                warn!(target: "Calls", "Negotiation failed: {e}");
                self.send_end_call().await;
                self.finish(EndReason::ConnectionLost).await;
            }
        }
    }

    async fn handle_negotiation(&mut self, event: NegotiationEvent) {
        match event {
            NegotiationEvent::Connected { call_id } => {
                let Some(call) = self.matching_call(&call_id) else {
                    return;
                };
                if !matches!(call.state, CallState::Connecting { .. }) {
                    return;
                }
                if let Err(e) = call.apply_transition(CallTransition::MediaConnected) {
                    warn!(target: "Calls", "{e}");
                    return;
                }
                self.cancel_timer();
                self.publish_snapshot();
                info!(target: "Calls", "Call {call_id} connected");
                self.emit(CallEvent::CallConnected { call_id });
            }
            NegotiationEvent::ConnectionLost { call_id } => {
                if self.matching_call(&call_id).is_some() {
                    warn!(target: "Calls", "Media connection lost for {call_id}");
                    self.send_end_call().await;
                    self.finish(EndReason::ConnectionLost).await;
                }
            }
            NegotiationEvent::RemoteTrackAdded {
                call_id,
                track_id,
                kind,
            } => {
                if self.matching_call(&call_id).is_some() {
                    self.emit(CallEvent::RemoteStreamAdded {
                        call_id,
                        track_id,
                        kind,
                    });
                }
            }
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::TimerFired { generation, kind } => {
                if generation != self.generation {
                    return;
                }
                self.on_timer(kind).await;
            }
            Internal::MediaStarted { generation, result } => {
                if generation != self.generation {
                    debug!(target: "Calls", "Discarding media setup result of a finished call");
                    return;
                }
                match result {
                    Ok(()) | Err(MediaError::Cancelled) => {}
                    Err(MediaError::Unavailable(detail)) => {
                        warn!(target: "Calls", "Local media unavailable: {detail}");
                        self.send_end_call().await;
                        self.finish(EndReason::MediaUnavailable).await;
                    }
                    Err(e) => {
                        warn!(target: "Calls", "Media setup failed: {e}");
                        self.send_end_call().await;
                        self.finish(EndReason::ConnectionLost).await;
                    }
                }
            }
        }
    }

    async fn on_timer(&mut self, kind: TimerKind) {
        let Some((call_id, state)) = self
            .current
            .as_ref()
            .map(|call| (call.call_id.clone(), call.state.clone()))
        else {
            return;
        };
        match (kind, state) {
            (TimerKind::Ring, CallState::OutgoingRinging { .. }) => {
                info!(target: "Calls", "No answer for {call_id}, giving up");
                self.send_end_call().await;
                self.finish(EndReason::Timeout).await;
            }
            (TimerKind::Ring, CallState::IncomingRinging { .. }) => {
                info!(target: "Calls", "Missed call {call_id}");
                self.send_reject(&call_id, RejectReason::Timeout).await;
                self.finish(EndReason::Timeout).await;
            }
            (TimerKind::Connect, CallState::Connecting { .. }) => {
                warn!(target: "Calls", "Call {call_id} did not connect in time");
                self.send_end_call().await;
                self.finish(EndReason::ConnectTimeout).await;
            }
            _ => {}
        }
    }

    /// The current call, if it is the one `call_id` refers to.
    fn matching_call(&mut self, call_id: &CallId) -> Option<&mut CallSession> {
        match self.current.as_mut() {
            Some(call) if &call.call_id == call_id => Some(call),
            _ => {
                debug!(target: "Calls", "Ignoring signaling for unknown call {call_id}");
                None
            }
        }
    }

    fn install(&mut self, call: CallSession) {
        self.generation += 1;
        self.current = Some(call);
        self.publish_snapshot();
    }

    async fn start_negotiation(&mut self, call_id: CallId, role: NegotiationRole, wants_video: bool) {
        let epoch = self.engine.begin(call_id, role, wants_video).await;
        let engine = self.engine.clone();
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = engine.establish(epoch).await;
            let _ = tx.send(Internal::MediaStarted { generation, result });
        });
        self.arm_timer(TimerKind::Connect, self.config.connect_timeout);
    }

    /// Moves the current call to `ended`, releases its media, and returns to idle.
    async fn finish(&mut self, reason: EndReason) {
        self.cancel_timer();
        let Some(mut call) = self.current.take() else {
            return;
        };
        self.generation += 1;
        self.engine.stop().await;

        if let Err(e) = call.apply_transition(CallTransition::Terminated { reason }) {
            warn!(target: "Calls", "{e}");
        }
        self.publish_snapshot();
        info!(target: "Calls", "Call {} ended ({reason:?})", call.call_id);

        let call_id = call.call_id.clone();
        let event = match reason {
            EndReason::Rejected | EndReason::RemoteRejected | EndReason::Busy => {
                CallEvent::CallRejected { call_id, reason }
            }
            EndReason::Timeout => CallEvent::CallTimeout { call_id },
            _ => CallEvent::CallEnded {
                call_id,
                reason,
                duration_secs: call.duration_secs(),
            },
        };
        self.emit(event);
    }

    async fn send_end_call(&self) {
        let Some(call) = &self.current else {
            return;
        };
        let end = OutboundMessage::EndCall(CallRef {
            call_id: call.call_id.clone(),
        });
        if !self.session.send(end).await {
            warn!(target: "Calls", "end_call for {} was not delivered", call.call_id);
        }
    }

    async fn send_reject(&self, call_id: &CallId, reason: RejectReason) {
        let rejection = OutboundMessage::RejectCall(CallRejection {
            call_id: call_id.clone(),
            reason: Some(reason),
        });
        if !self.session.send(rejection).await {
            warn!(target: "Calls", "reject_call for {call_id} was not delivered");
        }
    }

    fn arm_timer(&mut self, kind: TimerKind, duration: Duration) {
        self.cancel_timer();
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(Internal::TimerFired { generation, kind });
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn publish_snapshot(&self) {
        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = self.current.clone();
    }

    fn emit(&self, event: CallEvent) {
        debug!(target: "Calls", "Event {} for {}", event.name(), event.call_id());
        if self.events.send(event).is_err() {
            debug!(target: "Calls", "No call event subscribers");
        }
    }
}
