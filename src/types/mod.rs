pub mod call;
pub mod events;

pub use call::{CallDirection, CallId, CallKind, EndReason, Party};
pub use events::{CallEvent, Connectivity};
