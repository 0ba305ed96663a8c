use serde::Deserialize;
use std::time::Duration;

/// Tuning for the signaling session.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How often a `heartbeat_ack` is sent while connected.
    #[serde(with = "duration_ms", rename = "heartbeat_interval_ms")]
    pub heartbeat_interval: Duration,
    /// Drop the link and reconnect when nothing has been received for this long.
    #[serde(with = "duration_ms", rename = "heartbeat_max_silence_ms")]
    pub heartbeat_max_silence: Duration,
    #[serde(with = "duration_ms", rename = "reconnect_base_delay_ms")]
    pub reconnect_base_delay: Duration,
    #[serde(with = "duration_ms", rename = "reconnect_max_delay_ms")]
    pub reconnect_max_delay: Duration,
    /// Capacity of the inbound message broadcast channel.
    pub inbound_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_max_silence: Duration::from_secs(60),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            inbound_channel_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_max_silence(mut self, silence: Duration) -> Self {
        self.heartbeat_max_silence = silence;
        self
    }

    pub fn with_reconnect_delays(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base_delay = base;
        self.reconnect_max_delay = max.max(base);
        self
    }

    /// Delay before reconnect attempt number `attempt` (1-based): doubles from
    /// the base delay and saturates at the max delay.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.reconnect_base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.reconnect_max_delay)
    }
}

/// Tuning for the call state machine.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// How long an invite may ring before it counts as missed.
    #[serde(with = "duration_ms", rename = "ring_timeout_ms")]
    pub ring_timeout: Duration,
    /// How long a call may stay in `connecting` before it is abandoned.
    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,
    /// Tag automatic rejections of a second invite with a `busy` reason.
    pub send_busy_reason: bool,
    pub event_channel_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(45),
            connect_timeout: Duration::from_secs(30),
            send_busy_reason: true,
            event_channel_capacity: 64,
        }
    }
}

impl CallConfig {
    pub fn with_ring_timeout(mut self, timeout: Duration) -> Self {
        self.ring_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_busy_reason(mut self, send: bool) -> Self {
        self.send_busy_reason = send;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Peer connection settings handed to the peer connection factory.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec![
                    "stun:stun.l.google.com:19302".into(),
                    "stun:stun1.l.google.com:19302".into(),
                ],
                username: None,
                credential: None,
            }],
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_doubles_and_caps() {
        let config = SessionConfig::default()
            .with_reconnect_delays(Duration::from_millis(500), Duration::from_secs(5));
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(500));
        assert_eq!(config.reconnect_delay(2), Duration::from_secs(1));
        assert_eq!(config.reconnect_delay(3), Duration::from_secs(2));
        assert_eq!(config.reconnect_delay(4), Duration::from_secs(4));
        assert_eq!(config.reconnect_delay(5), Duration::from_secs(5));
        assert_eq!(config.reconnect_delay(500), Duration::from_secs(5));
    }

    #[test]
    fn test_configs_load_from_json_with_defaults() {
        let session: SessionConfig =
            serde_json::from_str(r#"{"heartbeat_interval_ms": 1500}"#).unwrap();
        assert_eq!(session.heartbeat_interval, Duration::from_millis(1500));
        assert_eq!(session.reconnect_max_delay, Duration::from_secs(30));

        let calls: CallConfig =
            serde_json::from_str(r#"{"ring_timeout_ms": 20000, "send_busy_reason": false}"#)
                .unwrap();
        assert_eq!(calls.ring_timeout, Duration::from_secs(20));
        assert_eq!(calls.connect_timeout, Duration::from_secs(30));
        assert!(!calls.send_busy_reason);

        let media: MediaConfig = serde_json::from_str(
            r#"{"ice_servers": [{"urls": ["turn:turn.example.com"], "username": "u", "credential": "p"}]}"#,
        )
        .unwrap();
        assert_eq!(media.ice_servers.len(), 1);
        assert_eq!(media.ice_servers[0].username.as_deref(), Some("u"));
    }
}
