use crate::calls::CallSession;
use crate::media::MediaKind;
use crate::types::call::{CallId, EndReason};
use serde::Serialize;

/// Connectivity of the signaling session, as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Connectivity {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting to retry after `attempt` consecutive failures.
    Reconnecting { attempt: u32 },
}

impl Connectivity {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

/// Observable side effects of the call state machine.
#[derive(Debug, Clone, Serialize)]
pub enum CallEvent {
    IncomingCall(CallSession),
    CallAccepted {
        call_id: CallId,
    },
    CallConnected {
        call_id: CallId,
    },
    CallRejected {
        call_id: CallId,
        reason: EndReason,
    },
    CallEnded {
        call_id: CallId,
        reason: EndReason,
        duration_secs: Option<i64>,
    },
    CallTimeout {
        call_id: CallId,
    },
    RemoteStreamAdded {
        call_id: CallId,
        track_id: String,
        kind: MediaKind,
    },
}

impl CallEvent {
    /// Event name as presented to the UI layer.
    pub fn name(&self) -> &'static str {
        match self {
            Self::IncomingCall(_) => "incoming_call",
            Self::CallAccepted { .. } => "call_accepted",
            Self::CallConnected { .. } => "call_connected",
            Self::CallRejected { .. } => "call_rejected",
            Self::CallEnded { .. } => "call_ended",
            Self::CallTimeout { .. } => "call_timeout",
            Self::RemoteStreamAdded { .. } => "remote_stream_added",
        }
    }

    pub fn call_id(&self) -> &CallId {
        match self {
            Self::IncomingCall(session) => &session.call_id,
            Self::CallAccepted { call_id }
            | Self::CallConnected { call_id }
            | Self::CallRejected { call_id, .. }
            | Self::CallEnded { call_id, .. }
            | Self::CallTimeout { call_id }
            | Self::RemoteStreamAdded { call_id, .. } => call_id,
        }
    }
}
