//! Access-mask and share-access bitmasks.
//!
//! An open request carries the rights it wants (`AccessMask`) and the
//! rights it is willing to let *other* opens use concurrently
//! (`ShareAccess`). Conflict detection is pairwise and symmetric: an open
//! requesting a right conflicts with an existing open whose share access
//! does not permit that right, and vice versa.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Rights requested by an open.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct AccessMask: u32 {
        /// Read file data
        const READ_DATA = 0x0000_0001;
        /// Write file data
        const WRITE_DATA = 0x0000_0002;
        /// Append to file data
        const APPEND_DATA = 0x0000_0004;
        /// Read file attributes
        const READ_ATTRIBUTES = 0x0000_0080;
        /// Write file attributes
        const WRITE_ATTRIBUTES = 0x0000_0100;
        /// Execute the file
        const EXECUTE = 0x0000_0020;
        /// Delete the file
        const DELETE = 0x0001_0000;
        /// Synchronize on the handle
        const SYNCHRONIZE = 0x0010_0000;
    }
}

bitflags! {
    /// Concurrent access an open permits other opens on the same file.
    ///
    /// These are *allow* bits: an absent bit denies that class of access
    /// to every other open for the lifetime of this one.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ShareAccess: u32 {
        /// Other opens may read
        const READ = 0x01;
        /// Other opens may write
        const WRITE = 0x02;
        /// Other opens may delete
        const DELETE = 0x04;
    }
}

impl ShareAccess {
    /// Deny nothing: read, write and delete all shared.
    pub const DENY_NONE: ShareAccess = ShareAccess::all();
}

impl AccessMask {
    /// Rights that touch file data or its existence. An open requesting
    /// none of these (and not truncating, see
    /// [`OpenDisposition::is_truncating`]) does not invalidate a cached
    /// oplock and so never forces a break.
    pub const DATA_BEARING: AccessMask = AccessMask::READ_DATA
        .union(AccessMask::WRITE_DATA)
        .union(AccessMask::APPEND_DATA)
        .union(AccessMask::EXECUTE)
        .union(AccessMask::DELETE);

    /// True if this mask requests any data/execute/delete right.
    pub fn bears_data(&self) -> bool {
        self.intersects(AccessMask::DATA_BEARING)
    }
}

/// What the open should do about an existing (or missing) file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpenDisposition {
    /// Replace the file if it exists, create it otherwise
    Supersede,
    /// Open the file, fail if missing
    Open,
    /// Create the file, fail if present
    Create,
    /// Open the file, create it if missing
    OpenIf,
    /// Open and truncate, fail if missing
    Overwrite,
    /// Open and truncate, create if missing
    OverwriteIf,
}

impl OpenDisposition {
    /// Dispositions that destroy existing file data on success.
    pub fn is_truncating(&self) -> bool {
        matches!(
            self,
            OpenDisposition::Supersede
                | OpenDisposition::Overwrite
                | OpenDisposition::OverwriteIf
        )
    }
}

/// Whether an open only touches metadata and therefore leaves cached
/// oplocks intact.
///
/// True iff the access mask requests no data/execute/delete right and the
/// disposition does not truncate. A truncating disposition modifies file
/// data regardless of the rights requested, so it always counts as
/// data-bearing.
pub fn is_attributes_only(access: AccessMask, disposition: OpenDisposition) -> bool {
    !access.bears_data() && !disposition.is_truncating()
}
