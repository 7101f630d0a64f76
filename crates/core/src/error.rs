//! Error types for the coordination system.
//!
//! We use `thiserror` for automatic `Display` and `Error` trait
//! implementations. The taxonomy follows three classes:
//!
//! - Conflict outcomes (`SharingViolation`, `DeletePending`) are expected
//!   control flow, surfaced to the caller for protocol-level translation.
//! - Transport and store errors (`Io`, `Store`) fail the current attempt;
//!   callers do not retry internally, stale state self-heals via GC.
//! - Protocol/logic violations (`BreakInProgress`, `CorruptMessage`,
//!   `Corruption`) are bugs, fatal to the current operation.
//!   `ClientUnresponsive` escalates further: the embedding server process
//!   is expected to terminate.

use crate::types::FileKey;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for coordination operations
pub type CoordResult<T> = std::result::Result<T, CoordError>;

/// Error types for the coordination system
#[derive(Debug, Error)]
pub enum CoordError {
    /// I/O error (socket send/receive, store file operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error for stored records
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Record store operation failed
    #[error("Store error: {0}")]
    Store(String),

    /// The open conflicts with the share mode of an existing open
    #[error("Sharing violation")]
    SharingViolation,

    /// The file has delete-on-close set by an existing open
    #[error("Delete pending")]
    DeletePending,

    /// An oplock break is already in flight for this handle
    #[error("Oplock break already in flight for {key:?}")]
    BreakInProgress {
        /// File the duplicate break was attempted against
        key: FileKey,
    },

    /// A received datagram failed validation
    #[error("Corrupt break message: {0}")]
    CorruptMessage(String),

    /// Shared state violated an invariant (empty persisted record,
    /// negative oplock counter, mismatched self entry)
    #[error("State corruption: {0}")]
    Corruption(String),

    /// The local client failed to acknowledge an oplock break in time.
    /// The embedding server cannot continue with undefined client cache
    /// state and must terminate after best-effort teardown.
    #[error("Client failed to acknowledge oplock break within {timeout:?}")]
    ClientUnresponsive {
        /// The break timeout that elapsed
        timeout: Duration,
    },

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<bincode::Error> for CoordError {
    fn from(e: bincode::Error) -> Self {
        CoordError::Serialization(e.to_string())
    }
}

impl CoordError {
    /// True for the conflict outcomes that are expected control flow
    /// rather than failures (never logged as bugs).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CoordError::SharingViolation | CoordError::DeletePending
        )
    }
}
