//! Media-related error types.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("media unavailable: {0}")]
    Unavailable(String),

    #[error("peer connection error: {0}")]
    PeerConnection(String),

    #[error("session description error: {0}")]
    Sdp(String),

    #[error("ice error: {0}")]
    Ice(String),

    #[error("no active negotiation")]
    NoActiveSession,

    #[error("call has no video track")]
    NoVideoTrack,

    #[error("not supported: {0}")]
    Unsupported(&'static str),

    /// The negotiation was stopped while this operation was in flight.
    #[error("negotiation was stopped before it completed")]
    Cancelled,
}
