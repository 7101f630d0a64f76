//! Share-mode table: the shared record store's view of every open file.
//!
//! This crate owns the lifecycle of [`ShareModeRecord`]s on top of the
//! opaque [`RecordStore`] seam: the per-key lock discipline, the record
//! codec, delete-on-empty, and the garbage collection that reclaims
//! entries left behind by dead processes.
//!
//! [`ShareModeRecord`]: opcoord_core::types::ShareModeRecord
//! [`RecordStore`]: opcoord_core::traits::RecordStore

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod store;
pub mod table;

pub use store::MemRecordStore;
pub use table::{RemovedEntry, ShareModeLock, ShareModeTable};
