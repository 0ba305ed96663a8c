use crate::protocol::OutboundMessage;
use crate::session::TransportSession;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::time::sleep;

impl TransportSession {
    fn is_current_generation(&self, generation: u64) -> bool {
        self.is_connected() && self.connection_generation.load(Ordering::SeqCst) == generation
    }

    /// Periodic `heartbeat_ack` for one connection generation. Exits when the
    /// session reconnects, disconnects, or the server has gone silent for
    /// longer than `heartbeat_max_silence`, in which case the read loop is told
    /// to drop the link so the run loop can redial.
    pub(crate) async fn heartbeat_loop(self: Arc<Self>, generation: u64) {
        let mut failures = 0u32;

        loop {
            let shutdown = self.shutdown_notifier.notified();
            tokio::pin!(shutdown);
            shutdown.as_mut().enable();

            if !self.is_current_generation(generation) {
                debug!(target: "Session/Heartbeat", "Generation {generation} is stale, exiting heartbeat loop.");
                return;
            }

            tokio::select! {
                _ = sleep(self.config.heartbeat_interval) => {
                    if !self.is_current_generation(generation) {
                        debug!(target: "Session/Heartbeat", "Not connected, exiting heartbeat loop.");
                        return;
                    }

                    let silence = self.time_since_last_receive();
                    if silence > self.config.heartbeat_max_silence {
                        warn!(
                            target: "Session/Heartbeat",
                            "Nothing received for {} seconds, forcing reconnect.",
                            silence.as_secs()
                        );
                        self.link_lost.notify_waiters();
                        return;
                    }

                    if self.send(OutboundMessage::HeartbeatAck {}).await {
                        if failures > 0 {
                            info!(target: "Session/Heartbeat", "Heartbeat restored.");
                        }
                        failures = 0;
                    } else {
                        failures += 1;
                        warn!(target: "Session/Heartbeat", "Heartbeat not delivered, failure count: {failures}");
                    }
                }
                _ = &mut shutdown => {
                    debug!(target: "Session/Heartbeat", "Shutdown signaled, exiting heartbeat loop.");
                    return;
                }
            }
        }
    }
}
