//! Call state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::CallInvite;
use crate::types::{CallDirection, CallId, CallKind, EndReason, Party};

/// Current state of a call. "Idle" is the absence of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CallState {
    /// Outgoing call: invite sent, waiting for the callee.
    OutgoingRinging { since: DateTime<Utc> },
    /// Incoming call: ringing locally.
    IncomingRinging { since: DateTime<Utc> },
    /// Call accepted, establishing media connection.
    Connecting { accepted_at: DateTime<Utc> },
    /// Media flowing.
    Active { connected_at: DateTime<Utc> },
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::OutgoingRinging { .. } => "outgoing_ringing",
            Self::IncomingRinging { .. } => "incoming_ringing",
            Self::Connecting { .. } => "connecting",
            Self::Active { .. } => "active",
            Self::Ended { .. } => "ended",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::OutgoingRinging { .. } | Self::IncomingRinging { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::IncomingRinging { .. })
    }

    /// Whether rejecting declines an invite rather than hanging up.
    pub fn can_reject(&self) -> bool {
        matches!(self, Self::IncomingRinging { .. })
    }
}

/// State transitions for calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    RemoteAccepted,
    LocalAccepted,
    MediaConnected,
    Terminated { reason: EndReason },
}

/// One call, from invite to end.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub call_id: CallId,
    pub caller: Party,
    pub callee_id: String,
    pub kind: CallKind,
    pub direction: CallDirection,
    pub created_at: DateTime<Utc>,
    pub state: CallState,
}

impl CallSession {
    pub fn new_outgoing(call_id: CallId, caller: Party, callee_id: impl Into<String>, kind: CallKind) -> Self {
        let now = Utc::now();
        Self {
            call_id,
            caller,
            callee_id: callee_id.into(),
            kind,
            direction: CallDirection::Outgoing,
            created_at: now,
            state: CallState::OutgoingRinging { since: now },
        }
    }

    pub fn new_incoming(invite: &CallInvite) -> Self {
        let caller = Party {
            id: invite.caller_id.clone(),
            name: invite.caller_name.clone(),
            avatar: invite.caller_avatar.clone(),
        };
        Self {
            call_id: invite.call_id.clone(),
            caller,
            callee_id: invite.receiver_id.clone(),
            kind: invite.call_type,
            direction: CallDirection::Incoming,
            created_at: invite.timestamp,
            state: CallState::IncomingRinging { since: Utc::now() },
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.direction == CallDirection::Outgoing
    }

    /// The other side of the call, from our point of view.
    pub fn peer_id(&self) -> &str {
        match self.direction {
            CallDirection::Outgoing => &self.callee_id,
            CallDirection::Incoming => &self.caller.id,
        }
    }

    /// Build the wire invite for an outgoing call.
    pub fn invite(&self) -> CallInvite {
        CallInvite {
            call_id: self.call_id.clone(),
            caller_id: self.caller.id.clone(),
            caller_name: self.caller.name.clone(),
            caller_avatar: self.caller.avatar.clone(),
            receiver_id: self.callee_id.clone(),
            call_type: self.kind,
            timestamp: self.created_at,
        }
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let new_state = match (&self.state, transition) {
            (CallState::OutgoingRinging { .. }, CallTransition::RemoteAccepted)
            | (CallState::IncomingRinging { .. }, CallTransition::LocalAccepted) => {
                CallState::Connecting {
                    accepted_at: Utc::now(),
                }
            }
            (CallState::Connecting { .. }, CallTransition::MediaConnected) => CallState::Active {
                connected_at: Utc::now(),
            },
            (CallState::Active { connected_at }, CallTransition::Terminated { reason }) => {
                let ended_at = Utc::now();
                CallState::Ended {
                    reason,
                    ended_at,
                    duration_secs: Some(ended_at.signed_duration_since(*connected_at).num_seconds()),
                }
            }
            (
                CallState::OutgoingRinging { .. }
                | CallState::IncomingRinging { .. }
                | CallState::Connecting { .. },
                CallTransition::Terminated { reason },
            ) => CallState::Ended {
                reason,
                ended_at: Utc::now(),
                duration_secs: None,
            },
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: current.name(),
                    attempted: transition,
                });
            }
        };
        self.state = new_state;
        Ok(())
    }

    pub fn duration_secs(&self) -> Option<i64> {
        match &self.state {
            CallState::Ended { duration_secs, .. } => *duration_secs,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: &'static str,
    pub attempted: CallTransition,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {:?} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
