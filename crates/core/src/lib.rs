//! Core types for the opcoord share-mode and oplock coordination system.
//!
//! This crate defines the data model shared by every layer: file keys,
//! share-mode records and entries, access/share bitmasks, configuration,
//! the error taxonomy, and the traits behind which the external
//! collaborators (record store, process liveness probe, per-connection
//! runtime) live.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod config;
pub mod error;
pub mod handles;
pub mod traits;
pub mod types;

pub use access::{AccessMask, OpenDisposition, ShareAccess};
pub use config::{CoordConfig, InodeWidth};
pub use error::{CoordError, CoordResult};
pub use handles::{HandleId, LocalHandle, LocalHandleTable};
pub use traits::{ConnectionRuntime, ProcessProbe, RecordStore};
pub use types::{FileKey, OpenIdentity, OplockKind, PendingOpen, ShareModeEntry, ShareModeRecord};
