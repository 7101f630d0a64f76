//! Share-mode data model.
//!
//! A [`ShareModeRecord`] is the unit of shared state: one record per open
//! file (keyed by filesystem identity), holding one [`ShareModeEntry`] per
//! open handle across all cooperating processes, plus the bookkeeping for
//! opens suspended behind an oplock break.
//!
//! Records are persisted in the shared record store as bincode bytes and
//! are only ever mutated while the owning process holds the key's chain
//! lock.

use crate::access::{AccessMask, ShareAccess};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Filesystem identity of a file: stable across renames, unique across
/// the whole store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileKey {
    /// Device the file lives on
    pub device_id: u32,
    /// Inode number within the device
    pub inode_id: u64,
}

impl FileKey {
    /// Create a key from a device/inode pair.
    pub fn new(device_id: u32, inode_id: u64) -> Self {
        FileKey {
            device_id,
            inode_id,
        }
    }

    /// Fixed-layout store key bytes: `device_id:u32 ++ inode_id:u64`,
    /// little-endian. Stable across process generations.
    pub fn store_key(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0..4].copy_from_slice(&self.device_id.to_le_bytes());
        buf[4..12].copy_from_slice(&self.inode_id.to_le_bytes());
        buf
    }

    /// Decode a store key produced by [`FileKey::store_key`].
    pub fn from_store_key(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 12 {
            return None;
        }
        let device_id = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let inode_id = u64::from_le_bytes(bytes[4..12].try_into().ok()?);
        Some(FileKey {
            device_id,
            inode_id,
        })
    }
}

/// Open-time identity of a handle, distinguishing repeated opens by a
/// reused pid. Seconds and microseconds of the open timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpenIdentity {
    /// Seconds component
    pub sec: u32,
    /// Microseconds component
    pub usec: u32,
}

impl OpenIdentity {
    /// Create an identity from a seconds/microseconds pair.
    pub fn new(sec: u32, usec: u32) -> Self {
        OpenIdentity { sec, usec }
    }
}

/// Kind of opportunistic cache lock a handle holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OplockKind {
    /// No oplock
    None,
    /// Exclusive read/write caching
    Exclusive,
    /// Exclusive caching plus close/reopen caching
    Batch,
    /// Read-caching only, shared between readers
    LevelII,
}

impl OplockKind {
    /// True for the exclusive levels (Exclusive or Batch) that must be
    /// broken before another data-bearing open may proceed.
    pub fn is_exclusive_level(&self) -> bool {
        matches!(self, OplockKind::Exclusive | OplockKind::Batch)
    }

    /// True if any oplock is held.
    pub fn exists(&self) -> bool {
        !matches!(self, OplockKind::None)
    }
}

/// One open handle's claim on a file, as visible to every cooperating
/// process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareModeEntry {
    /// Owning process
    pub pid: u32,
    /// Rights the open requested (needed for the symmetric sharing check)
    pub access_mask: AccessMask,
    /// Access this open permits other opens
    pub share_access: ShareAccess,
    /// Oplock held by this handle
    pub oplock: OplockKind,
    /// Loopback port of the owner's break messenger
    pub break_port: u16,
    /// Open-time identity disambiguating reused pids
    pub open_identity: OpenIdentity,
    /// Whether this handle requested delete-on-close
    pub delete_on_close: bool,
}

impl ShareModeEntry {
    /// True if this entry belongs to the given pid/open-identity pair.
    /// Matching is by persistent identity, not in-process handle
    /// identity, so it survives local destruction-order differences.
    pub fn matches(&self, pid: u32, identity: OpenIdentity) -> bool {
        self.pid == pid && self.open_identity == identity
    }
}

/// An open suspended behind an oplock break, waiting to be retried.
///
/// Appended under the key's chain lock when the conflict check reports
/// that a break is required; every pending open under a key is notified
/// (at-least-once) when an entry is removed or downgraded, and simply
/// re-runs the whole conflict check. The retry is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOpen {
    /// Process waiting to retry
    pub pid: u32,
    /// Messenger port to send the retry notification to
    pub notify_port: u16,
    /// Token identifying the suspended open within its process
    pub retry_token: Uuid,
}

/// All share-mode state for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareModeRecord {
    /// Filesystem identity this record covers
    pub key: FileKey,
    /// One entry per open handle, all processes. Order is irrelevant.
    pub entries: Vec<ShareModeEntry>,
    /// Opens suspended behind a break on this file
    pub pending_opens: Vec<PendingOpen>,
}

impl ShareModeRecord {
    /// Create an empty record for a key. Never persisted in this state:
    /// the table deletes records whose entry list is empty.
    pub fn new(key: FileKey) -> Self {
        ShareModeRecord {
            key,
            entries: Vec::new(),
            pending_opens: Vec::new(),
        }
    }

    /// True if the record holds no entries (and must not be persisted).
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if any entry has delete-on-close set.
    pub fn delete_pending(&self) -> bool {
        self.entries.iter().any(|e| e.delete_on_close)
    }

    /// Number of entries holding an Exclusive or Batch oplock.
    ///
    /// At most one, except transiently while a break against the others
    /// is in flight.
    pub fn exclusive_holders(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.oplock.is_exclusive_level())
            .count()
    }
}
