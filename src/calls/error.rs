//! Call-related error types.

use crate::media::MediaError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("no current call")]
    NoCall,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("operation not allowed while call is {0}")]
    InvalidState(&'static str),

    #[error("already in a call: {0}")]
    Busy(String),

    #[error("not connected")]
    NotConnected,

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("call coordinator has stopped")]
    Stopped,
}
