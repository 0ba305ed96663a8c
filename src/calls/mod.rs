//! Call Lifecycle Coordinator.
//!
//! - [`CallSession`] & [`CallState`]: the per-call state machine
//! - [`CallCoordinator`]: the task that owns the current call and reacts to
//!   commands, inbound signaling, negotiation events, and timeouts
//! - [`CallHandle`]: imperative controls and the event stream for the UI layer
//!
//! At most one call exists at a time. An invite that arrives while a call is
//! in progress is rejected automatically.

mod coordinator;
mod error;
mod state;


pub use coordinator::{CallCoordinator, CallHandle};
pub use error::CallError;
pub use state::{CallSession, CallState, CallTransition, InvalidTransition};
