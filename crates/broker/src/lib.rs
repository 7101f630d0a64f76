//! Open/close coordination for cooperating file-server processes:
//! conflict decisions, oplock grants, and the break machinery that
//! revokes a peer's (or our own client's) cached oplock when a new open
//! needs it gone.
//!
//! The [`OplockCoordinator`] is the per-process front end; the
//! [`BreakExecutor`] services break requests against this process's own
//! client; the [`OplockRuntime`] carries the per-process mutable state
//! both of them share.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod executor;
pub mod runtime;

pub use coordinator::{
    decide_open, share_conflict, OpenDecision, OpenGrant, OpenRequest, OplockCoordinator,
};
pub use executor::{BreakExecutor, BreakOutcome};
pub use runtime::{DeferredRequest, OplockRuntime, RequestClass};
