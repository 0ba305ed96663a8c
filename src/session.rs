//! Transport Session Manager.
//!
//! Owns the one logical connection to the signaling server. A spawned run
//! loop dials through a [`TransportFactory`], replays room membership after
//! every successful (re)connect, pumps inbound frames onto a broadcast
//! channel, and retries with capped exponential backoff until
//! [`TransportSession::disconnect`] is called.

use crate::config::SessionConfig;
use crate::protocol::{InboundMessage, OutboundMessage, RoomRef};
use crate::transport::{ConnectTarget, Transport, TransportEvent, TransportFactory};
use crate::types::events::Connectivity;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, broadcast, mpsc};
use tokio::time::{Instant, sleep};

pub type ListenerId = u64;

/// Observer for connectivity changes.
pub trait ConnectivityListener: Send + Sync {
    fn on_connectivity_change(&self, status: Connectivity);
}

impl<F> ConnectivityListener for F
where
    F: Fn(Connectivity) + Send + Sync,
{
    fn on_connectivity_change(&self, status: Connectivity) {
        self(status)
    }
}

/// Best-effort delivery of signaling messages.
///
/// `false` means "not delivered"; callers decide whether that is fatal.
#[async_trait]
pub trait SignalSender: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> bool;
}

pub struct TransportSession {
    factory: Arc<dyn TransportFactory>,
    pub(crate) config: SessionConfig,

    transport: Mutex<Option<Arc<dyn Transport>>>,
    /// Held for the whole replay so a concurrent join is sent exactly once.
    rooms: Mutex<Vec<String>>,

    is_running: AtomicBool,
    is_connected: AtomicBool,
    /// Bumped by every `connect`; a run loop from an older call exits.
    run_epoch: AtomicU64,
    /// Bumped on every successful connect; stale heartbeat loops exit.
    pub(crate) connection_generation: AtomicU64,
    pub(crate) shutdown_notifier: Notify,
    pub(crate) link_lost: Notify,
    last_received: StdMutex<Instant>,

    connectivity: StdMutex<Connectivity>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ConnectivityListener>)>>,
    next_listener_id: AtomicU64,

    inbound_tx: broadcast::Sender<Arc<InboundMessage>>,
}

impl TransportSession {
    pub fn new(factory: Arc<dyn TransportFactory>, config: SessionConfig) -> Arc<Self> {
        let (inbound_tx, _) = broadcast::channel(config.inbound_channel_capacity.max(1));
        Arc::new(Self {
            factory,
            config,
            transport: Mutex::new(None),
            rooms: Mutex::new(Vec::new()),
            is_running: AtomicBool::new(false),
            is_connected: AtomicBool::new(false),
            run_epoch: AtomicU64::new(0),
            connection_generation: AtomicU64::new(0),
            shutdown_notifier: Notify::new(),
            link_lost: Notify::new(),
            last_received: StdMutex::new(Instant::now()),
            connectivity: StdMutex::new(Connectivity::Disconnected),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            inbound_tx,
        })
    }

    /// Starts the connect/reconnect loop. A no-op while a loop is already
    /// running, whether it is connected or still dialing.
    pub fn connect(self: &Arc<Self>, target: ConnectTarget) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            debug!(target: "Session", "connect called while already running; ignoring");
            return;
        }
        let epoch = self.run_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let session = self.clone();
        tokio::spawn(async move { session.run(target, epoch).await });
    }

    /// Tears the connection down and forgets joined rooms. Terminal until the
    /// next `connect`.
    pub async fn disconnect(&self) {
        info!(target: "Session", "Disconnecting session intentionally.");
        self.is_running.store(false, Ordering::SeqCst);
        self.shutdown_notifier.notify_waiters();

        let transport = self.transport.lock().await.take();
        self.is_connected.store(false, Ordering::SeqCst);
        if let Some(transport) = transport {
            transport.disconnect().await;
        }
        self.rooms.lock().await.clear();
        self.set_connectivity(Connectivity::Disconnected);
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    pub fn connectivity(&self) -> Connectivity {
        *self
            .connectivity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn joined_rooms(&self) -> Vec<String> {
        self.rooms.lock().await.clone()
    }

    /// Records the room and, when connected, tells the server right away.
    /// Returns whether a `join_room` went out now.
    pub async fn join_room(&self, room_id: impl Into<String>) -> bool {
        let room_id = room_id.into();
        let mut rooms = self.rooms.lock().await;
        if rooms.contains(&room_id) {
            return false;
        }
        rooms.push(room_id.clone());
        if !self.is_connected() {
            debug!(target: "Session", "Queued room {room_id} for the next connect");
            return false;
        }
        self.send(OutboundMessage::JoinRoom(RoomRef { room_id })).await
    }

    pub async fn leave_room(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.lock().await;
        let before = rooms.len();
        rooms.retain(|r| r != room_id);
        if rooms.len() == before || !self.is_connected() {
            return false;
        }
        self.send(OutboundMessage::LeaveRoom(RoomRef {
            room_id: room_id.to_string(),
        }))
        .await
    }

    /// Sends one message. Never errors; `false` means not delivered.
    pub async fn send(&self, message: OutboundMessage) -> bool {
        if !self.is_connected() {
            debug!(target: "Session", "Not connected, dropping {}", message.name());
            return false;
        }
        let transport = self.transport.lock().await.clone();
        match transport {
            Some(transport) => self.send_on(transport.as_ref(), &message).await,
            None => false,
        }
    }

    /// Receiver for every decoded inbound message except heartbeats.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<InboundMessage>> {
        self.inbound_tx.subscribe()
    }

    /// Registers an observer and immediately reports the current status to it.
    pub fn on_connectivity_change(&self, listener: Arc<dyn ConnectivityListener>) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener.clone()));
        listener.on_connectivity_change(self.connectivity());
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn set_connectivity(&self, status: Connectivity) {
        {
            let mut current = self
                .connectivity
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *current == status {
                return;
            }
            *current = status;
        }
        debug!(target: "Session", "Connectivity changed to {status:?}");
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener.on_connectivity_change(status);
        }
    }

    fn is_current_run(&self, epoch: u64) -> bool {
        self.is_running.load(Ordering::SeqCst) && self.run_epoch.load(Ordering::SeqCst) == epoch
    }

    pub(crate) fn time_since_last_receive(&self) -> Duration {
        self.last_received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn mark_received(&self) {
        *self
            .last_received
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    async fn send_on(&self, transport: &dyn Transport, message: &OutboundMessage) -> bool {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                error!(target: "Session", "Failed to encode {}: {e}", message.name());
                return false;
            }
        };
        match transport.send_text(&text).await {
            Ok(()) => {
                debug!(target: "Session", "--> {}", message.name());
                true
            }
            Err(e) => {
                warn!(target: "Session", "Failed to send {}: {e}", message.name());
                false
            }
        }
    }

    async fn run(self: Arc<Self>, target: ConnectTarget, epoch: u64) {
        let mut attempt: u32 = 0;
        while self.is_current_run(epoch) {
            self.set_connectivity(Connectivity::Connecting);

            match self.establish(&target, epoch).await {
                Ok(events) => {
                    attempt = 0;
                    self.read_loop(events, epoch).await;
                    self.cleanup_connection_state(epoch).await;
                }
                Err(e) => {
                    warn!(target: "Session", "Connection attempt failed: {e}");
                }
            }

            if !self.is_current_run(epoch) {
                break;
            }

            attempt = attempt.saturating_add(1);
            let delay = self.config.reconnect_delay(attempt);
            self.set_connectivity(Connectivity::Reconnecting { attempt });
            info!(
                target: "Session",
                "Will attempt to reconnect in {:?} (attempt {})",
                delay,
                attempt
            );
            if !self.sleep_unless_shutdown(delay, epoch).await {
                break;
            }
        }
        info!(target: "Session", "Session run loop has shut down.");
    }

    async fn establish(
        self: &Arc<Self>,
        target: &ConnectTarget,
        epoch: u64,
    ) -> Result<mpsc::Receiver<TransportEvent>, anyhow::Error> {
        let (transport, events) = self.factory.create_transport(target).await?;
        if !self.is_current_run(epoch) {
            transport.disconnect().await;
            return Err(anyhow::anyhow!("session stopped while dialing"));
        }

        *self.transport.lock().await = Some(transport.clone());
        self.mark_received();
        let generation = self.connection_generation.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let rooms = self.rooms.lock().await;
            self.is_connected.store(true, Ordering::SeqCst);
            for room_id in rooms.iter() {
                let join = OutboundMessage::JoinRoom(RoomRef {
                    room_id: room_id.clone(),
                });
                if !self.send_on(transport.as_ref(), &join).await {
                    warn!(target: "Session", "Failed to rejoin room {room_id}");
                }
            }
            if !rooms.is_empty() {
                info!(target: "Session", "Rejoined {} room(s) after connect", rooms.len());
            }
        }

        if !self.is_current_run(epoch) {
            self.is_connected.store(false, Ordering::SeqCst);
            transport.disconnect().await;
            return Err(anyhow::anyhow!("session stopped while replaying rooms"));
        }

        info!(target: "Session", "Connected (generation {generation})");
        self.set_connectivity(Connectivity::Connected);

        let session = self.clone();
        tokio::spawn(async move { session.heartbeat_loop(generation).await });

        Ok(events)
    }

    async fn read_loop(&self, mut events: mpsc::Receiver<TransportEvent>, epoch: u64) {
        let shutdown = self.shutdown_notifier.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        let link_lost = self.link_lost.notified();
        tokio::pin!(link_lost);
        link_lost.as_mut().enable();

        if !self.is_current_run(epoch) {
            return;
        }

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(target: "Session", "Shutdown signaled in read loop.");
                    return;
                }
                _ = &mut link_lost => {
                    warn!(target: "Session", "Link declared dead, dropping transport.");
                    return;
                }
                event = events.recv() => match event {
                    Some(TransportEvent::TextReceived(text)) => self.handle_frame(&text).await,
                    Some(TransportEvent::Connected) => {
                        debug!(target: "Session", "Transport connected event received");
                    }
                    Some(TransportEvent::Disconnected) | None => {
                        info!(target: "Session", "Transport disconnected unexpectedly.");
                        return;
                    }
                },
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        self.mark_received();
        match InboundMessage::decode(text) {
            Ok(InboundMessage::Heartbeat {}) => {
                debug!(target: "Session/Heartbeat", "Server heartbeat, acknowledging");
                self.send(OutboundMessage::HeartbeatAck {}).await;
            }
            Ok(message) => {
                debug!(target: "Session", "<-- {}", message.name());
                if self.inbound_tx.send(Arc::new(message)).is_err() {
                    debug!(target: "Session", "No subscribers for inbound message");
                }
            }
            Err(e) => {
                warn!(target: "Session", "Dropping undecodable frame: {e}");
            }
        }
    }

    async fn cleanup_connection_state(&self, epoch: u64) {
        if !self.is_current_run(epoch) {
            return;
        }
        self.is_connected.store(false, Ordering::SeqCst);
        if let Some(transport) = self.transport.lock().await.take() {
            transport.disconnect().await;
        }
    }

    /// Returns `false` when the run was stopped during the wait.
    async fn sleep_unless_shutdown(&self, delay: Duration, epoch: u64) -> bool {
        let shutdown = self.shutdown_notifier.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        if !self.is_current_run(epoch) {
            return false;
        }
        tokio::select! {
            _ = sleep(delay) => self.is_current_run(epoch),
            _ = &mut shutdown => false,
        }
    }
}

#[async_trait]
impl SignalSender for TransportSession {
    async fn send(&self, message: OutboundMessage) -> bool {
        TransportSession::send(self, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{LoopbackServer, settle};

    fn target() -> ConnectTarget {
        ConnectTarget::new("ws://signal.test/ws").with_credential("token-alice")
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let server = LoopbackServer::new();
        let session = TransportSession::new(server.factory("alice"), SessionConfig::default());

        session.connect(target());
        session.connect(target());
        settle().await;
        session.connect(target());
        settle().await;

        assert!(session.is_connected());
        assert_eq!(server.dial_count("alice"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected_fails_softly() {
        let server = LoopbackServer::new();
        let session = TransportSession::new(server.factory("alice"), SessionConfig::default());

        assert!(!session.send(OutboundMessage::HeartbeatAck {}).await);
        assert!(!session.join_room("conv-1").await);
        assert_eq!(session.joined_rooms().await, vec!["conv-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rooms_joined_offline_are_sent_on_connect() {
        let server = LoopbackServer::new();
        let session = TransportSession::new(server.factory("alice"), SessionConfig::default());

        session.join_room("conv-1").await;
        session.join_room("conv-2").await;
        session.join_room("conv-1").await;
        session.connect(target());
        settle().await;

        assert_eq!(server.join_count("alice", "conv-1"), 1);
        assert_eq!(server.join_count("alice", "conv-2"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_every_room_exactly_once() {
        let server = LoopbackServer::new();
        let session = TransportSession::new(server.factory("alice"), SessionConfig::default());
        session.connect(target());
        settle().await;

        for room in ["conv-1", "conv-2", "conv-3"] {
            assert!(session.join_room(room).await);
        }
        assert!(session.leave_room("conv-2").await);
        server.clear_log("alice");

        server.drop_connection("alice");
        settle().await;
        assert!(!session.is_connected());

        tokio::time::advance(session.config.reconnect_delay(1)).await;
        settle().await;

        assert!(session.is_connected());
        assert_eq!(server.dial_count("alice"), 2);
        assert_eq!(server.join_count("alice", "conv-1"), 1);
        assert_eq!(server.join_count("alice", "conv-2"), 0);
        assert_eq!(server.join_count("alice", "conv-3"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_server_comes_back() {
        let server = LoopbackServer::new();
        server.set_reachable(false);
        let session = TransportSession::new(server.factory("alice"), SessionConfig::default());
        session.join_room("conv-1").await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        session.on_connectivity_change(Arc::new(move |status: Connectivity| {
            seen_clone.lock().unwrap().push(status);
        }));

        session.connect(target());
        settle().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert!(!session.is_connected());

        server.set_reachable(true);
        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;

        assert!(session.is_connected());
        assert_eq!(server.join_count("alice", "conv-1"), 1);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.first(), Some(&Connectivity::Disconnected));
        assert!(seen.contains(&Connectivity::Reconnecting { attempt: 1 }));
        assert!(seen.contains(&Connectivity::Reconnecting { attempt: 3 }));
        assert_eq!(seen.last(), Some(&Connectivity::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_clears_rooms_and_stops_retrying() {
        let server = LoopbackServer::new();
        let session = TransportSession::new(server.factory("alice"), SessionConfig::default());
        session.connect(target());
        settle().await;
        session.join_room("conv-1").await;

        session.disconnect().await;
        settle().await;
        assert!(!session.is_connected());
        assert_eq!(session.connectivity(), Connectivity::Disconnected);
        assert!(session.joined_rooms().await.is_empty());

        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(server.dial_count("alice"), 1);

        session.connect(target());
        settle().await;
        assert!(session.is_connected());
        assert_eq!(server.dial_count("alice"), 2);
        assert_eq!(server.join_count("alice", "conv-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_gets_current_status_on_registration() {
        let server = LoopbackServer::new();
        let session = TransportSession::new(server.factory("alice"), SessionConfig::default());
        session.connect(target());
        settle().await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let id = session.on_connectivity_change(Arc::new(move |status: Connectivity| {
            seen_clone.lock().unwrap().push(status);
        }));
        assert_eq!(*seen.lock().unwrap(), vec![Connectivity::Connected]);

        assert!(session.off(id));
        assert!(!session.off(id));
        session.disconnect().await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_heartbeat_is_acknowledged() {
        let server = LoopbackServer::new();
        let session = TransportSession::new(server.factory("alice"), SessionConfig::default());
        session.connect(target());
        settle().await;
        server.clear_log("alice");

        server.push_raw("alice", r#"{"event":"heartbeat"}"#);
        settle().await;

        assert_eq!(server.sent_names("alice"), vec!["heartbeat_ack"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_frames_are_dropped() {
        let server = LoopbackServer::new();
        let session = TransportSession::new(server.factory("alice"), SessionConfig::default());
        let mut inbound = session.subscribe();
        session.connect(target());
        settle().await;

        server.push_raw("alice", "garbage");
        server.push_raw("alice", r#"{"event":"call_ended","data":{"callId":"C9"}}"#);
        settle().await;

        let msg = inbound.try_recv().unwrap();
        assert_eq!(msg.name(), "call_ended");
        assert!(inbound.try_recv().is_err());
        assert!(session.is_connected());
    }
}
