use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Caller-generated identifier of a single call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// 16 random bytes, upper-case hex.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Voice,
    Video,
}

impl CallKind {
    pub fn wants_video(self) -> bool {
        self == Self::Video
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// A user taking part in a call, as announced in the invite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub id: String,
    pub name: String,
    pub avatar: Option<String>,
}

impl Party {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// Why a call left the non-terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndReason {
    /// We hung up.
    Hangup,
    /// The peer hung up.
    RemoteHangup,
    /// We declined the invite.
    Rejected,
    /// The peer declined the invite.
    RemoteRejected,
    /// The peer was already in a call.
    Busy,
    /// Nobody answered before the ringing timeout.
    Timeout,
    /// Media negotiation did not complete in time.
    ConnectTimeout,
    /// Camera or microphone could not be acquired.
    MediaUnavailable,
    /// The peer connection failed or was closed underneath us.
    ConnectionLost,
}
