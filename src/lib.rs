//! Real-time call signaling and media negotiation.
//!
//! Three layers, bottom up:
//! - [`session`]: one logical connection to the signaling server, with
//!   heartbeats, reconnect, and room membership replay
//! - [`media`]: the offer/answer and ICE exchange for a single call
//! - [`calls`]: the call state machine tying the two together

pub mod calls;
pub mod config;
mod keepalive;
pub mod media;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use calls::{CallCoordinator, CallError, CallHandle, CallSession, CallState};
pub use config::{CallConfig, IceServer, MediaConfig, SessionConfig};
pub use media::{MediaError, NegotiationEngine};
pub use session::{SignalSender, TransportSession};
pub use types::{CallEvent, CallId, CallKind, Connectivity, EndReason, Party};
