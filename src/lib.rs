//! opcoord - Share-mode and oplock-break coordination for cooperating
//! file-server processes.
//!
//! Multiple server processes share one record store describing every
//! open file. Before a process grants an open it runs the share-mode
//! conflict decision against that store; when a conflicting open is
//! covered by a peer's exclusive oplock, the peer is asked over a
//! loopback datagram to break it, bounded by a timeout so a dead peer
//! never wedges the opener.
//!
//! # Quick Start
//!
//! ```ignore
//! use opcoord::{
//!     AccessMask, CoordConfig, FileKey, MemRecordStore, OpenDisposition,
//!     OpenIdentity, OpenRequest, OplockCoordinator, OplockKind, ShareAccess,
//! };
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemRecordStore::new());
//! let mut coord = OplockCoordinator::start(store, &probe, pid, CoordConfig::default())?;
//!
//! let grant = coord.open_file(&mut conn, FileKey::new(dev, ino), identity, &OpenRequest {
//!     access_mask: AccessMask::READ_DATA | AccessMask::WRITE_DATA,
//!     share_access: ShareAccess::DENY_NONE,
//!     disposition: OpenDisposition::OpenIf,
//!     requested_oplock: OplockKind::Batch,
//!     delete_on_close: false,
//! })?;
//! // ... serve the client ...
//! coord.close_file(grant.handle)?;
//! ```
//!
//! # Architecture
//!
//! - `opcoord-core`: shared types, bitmasks, configuration, errors, and
//!   the traits fronting the record store, the process liveness probe
//!   and the per-connection runtime.
//! - `opcoord-table`: the share-mode table over the record store, with
//!   per-key locking and dead-process garbage collection.
//! - `opcoord-wire`: the loopback datagram codec and break messenger.
//! - `opcoord-broker`: the conflict decision, the open/close driver and
//!   the local break executor.

pub use opcoord_core::access::{is_attributes_only, AccessMask, OpenDisposition, ShareAccess};
pub use opcoord_core::config::{CoordConfig, InodeWidth};
pub use opcoord_core::error::{CoordError, CoordResult};
pub use opcoord_core::handles::{HandleId, LocalHandle, LocalHandleTable};
pub use opcoord_core::traits::{ConnectionRuntime, ProcessProbe, RecordStore};
pub use opcoord_core::types::{
    FileKey, OpenIdentity, OplockKind, PendingOpen, ShareModeEntry, ShareModeRecord,
};

pub use opcoord_table::{MemRecordStore, RemovedEntry, ShareModeLock, ShareModeTable};

pub use opcoord_wire::{BreakCommand, BreakMessage, BreakMessenger, BreakResponder, WireError};

pub use opcoord_broker::{
    decide_open, share_conflict, BreakExecutor, BreakOutcome, DeferredRequest, OpenDecision,
    OpenGrant, OpenRequest, OplockCoordinator, OplockRuntime, RequestClass,
};
