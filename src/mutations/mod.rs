//! Fire-and-forget writes.
//!
//! Callers hand a [`MutationIntent`](crate::types::MutationIntent) to the
//! [`MutationDispatcher`] and carry on. The write happens on a background
//! thread; a failure is reported to the error surface, a success shows up
//! as a fresh snapshot on any subscription watching the written data.

mod dispatcher;

pub use dispatcher::{DispatchConfig, DispatchStats, MutationDispatcher};
