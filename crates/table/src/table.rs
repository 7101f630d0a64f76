//! Share-mode record lifecycle on top of the record store.
//!
//! All read-modify-write sequences on a record happen through a
//! [`ShareModeLock`] guard, which holds the key's advisory chain lock
//! for its lifetime. Putting the mutating operations on the guard makes
//! the locking discipline a compile-time property rather than a calling
//! convention.
//!
//! Invariants enforced here:
//! - a record with zero entries is never persisted (delete-on-empty);
//! - `(pid, open_identity)` is unique within a record;
//! - a fetched record that decodes to zero entries is corruption.

use opcoord_core::error::{CoordError, CoordResult};
use opcoord_core::traits::{ProcessProbe, RecordStore};
use opcoord_core::types::{
    FileKey, OpenIdentity, PendingOpen, ShareModeEntry, ShareModeRecord,
};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Share-mode table over an opaque record store.
pub struct ShareModeTable<S> {
    store: Arc<S>,
    self_pid: u32,
}

impl<S: RecordStore> ShareModeTable<S> {
    /// Open the table, sweeping entries left behind by dead processes
    /// (original startup reconciliation; `check_self` is off because our
    /// own pid legitimately has no entries yet but might collide with a
    /// reused one).
    pub fn open(store: Arc<S>, probe: &dyn ProcessProbe, self_pid: u32) -> CoordResult<Self> {
        let table = ShareModeTable { store, self_pid };
        let reclaimed = table.garbage_collect(probe, false)?;
        if reclaimed > 0 {
            info!(
                target: "opcoord::table",
                reclaimed,
                "reclaimed stale share mode entries at startup"
            );
        }
        Ok(table)
    }

    /// Shut the table down, sweeping again. At this point an entry owned
    /// by the calling process is a leak and is logged as a bug.
    pub fn shutdown(&self, probe: &dyn ProcessProbe) -> CoordResult<usize> {
        self.garbage_collect(probe, true)
    }

    /// The pid this table instance writes entries for.
    pub fn self_pid(&self) -> u32 {
        self.self_pid
    }

    /// Acquire the advisory chain lock for a key, returning the guard
    /// through which all mutations run.
    pub fn lock(&self, key: FileKey) -> ShareModeLock<'_, S> {
        let store_key = key.store_key();
        self.store.chainlock(&store_key);
        ShareModeLock {
            store: &self.store,
            key,
            store_key,
        }
    }

    /// Visit every entry in the table without locking. Diagnostic use
    /// only (status listings); the view may be torn across keys.
    pub fn forall(
        &self,
        f: &mut dyn FnMut(&FileKey, &ShareModeEntry) -> CoordResult<()>,
    ) -> CoordResult<()> {
        self.store.traverse(&mut |_, data| {
            let record: ShareModeRecord = bincode::deserialize(data)?;
            for entry in &record.entries {
                f(&record.key, entry)?;
            }
            Ok(())
        })
    }

    /// Delete every entry owned by a process that no longer exists.
    ///
    /// Dead entries are always a bug somewhere (a process died without
    /// closing, or a break timed out against a dead peer), so each one
    /// is logged loudly. With `check_self` set, entries owned by the
    /// calling process itself are also logged and deleted: there should
    /// be none left at shutdown.
    ///
    /// Returns the number of entries reclaimed.
    pub fn garbage_collect(&self, probe: &dyn ProcessProbe, check_self: bool) -> CoordResult<usize> {
        let mut reclaimed = 0usize;
        self.store.traverse(&mut |store_key, _| {
            self.store.chainlock(store_key);
            let result = self.collect_record(store_key, probe, check_self, &mut reclaimed);
            self.store.chainunlock(store_key);
            result
        })?;
        Ok(reclaimed)
    }

    /// GC one record, chain lock held. Refetches under the lock: the
    /// traversal snapshot may be stale.
    fn collect_record(
        &self,
        store_key: &[u8],
        probe: &dyn ProcessProbe,
        check_self: bool,
        reclaimed: &mut usize,
    ) -> CoordResult<()> {
        let data = match self.store.fetch(store_key)? {
            Some(data) => data,
            None => return Ok(()), // deleted since the snapshot
        };
        let mut record: ShareModeRecord = match bincode::deserialize(&data) {
            Ok(record) => record,
            Err(e) => {
                error!(
                    target: "opcoord::table",
                    error = %e,
                    "undecodable share mode record - deleting"
                );
                *reclaimed += 1;
                return self.store.delete(store_key);
            }
        };

        let before = record.entries.len();
        record.entries.retain(|entry| {
            if check_self && entry.pid == self.self_pid {
                error!(
                    target: "opcoord::table",
                    pid = entry.pid,
                    device_id = record.key.device_id,
                    inode_id = record.key.inode_id,
                    "LOGIC ERROR: shutting down with an entry for my own pid"
                );
            } else if probe.process_exists(entry.pid) {
                return true;
            } else {
                error!(
                    target: "opcoord::table",
                    pid = entry.pid,
                    device_id = record.key.device_id,
                    inode_id = record.key.inode_id,
                    "LOGIC ERROR: entry owned by a process that no longer exists - deleting"
                );
            }
            *reclaimed += 1;
            false
        });

        if record.entries.len() == before {
            // Nothing reclaimed; leave the stored record untouched.
            Ok(())
        } else if record.entries.is_empty() {
            self.store.delete(store_key)
        } else {
            self.store.store(store_key, &bincode::serialize(&record)?)
        }
    }
}

/// An entry removed from a record, together with the pending opens that
/// were waiting behind it and must now be notified (at-least-once).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedEntry {
    /// The removed entry
    pub entry: ShareModeEntry,
    /// Pending opens drained from the record
    pub pending_opens: Vec<PendingOpen>,
}

/// RAII guard over one key's chain lock; releases on drop. All record
/// mutations go through this guard.
pub struct ShareModeLock<'a, S: RecordStore> {
    store: &'a Arc<S>,
    key: FileKey,
    store_key: [u8; 12],
}

impl<'a, S: RecordStore> ShareModeLock<'a, S> {
    /// The key this guard locks.
    pub fn key(&self) -> FileKey {
        self.key
    }

    /// Fetch the record. Absent is not an error; a persisted record
    /// with zero entries is.
    pub fn get(&self) -> CoordResult<Option<ShareModeRecord>> {
        let data = match self.store.fetch(&self.store_key)? {
            Some(data) => data,
            None => return Ok(None),
        };
        let record: ShareModeRecord = bincode::deserialize(&data)?;
        if record.is_empty() {
            error!(
                target: "opcoord::table",
                device_id = self.key.device_id,
                inode_id = self.key.inode_id,
                "persisted share mode record has zero entries"
            );
            return Err(CoordError::Corruption(
                "share mode record with zero entries".to_string(),
            ));
        }
        Ok(Some(record))
    }

    /// Store the record back, or delete it if its entry list is empty.
    pub fn put(&self, record: &ShareModeRecord) -> CoordResult<()> {
        if record.is_empty() {
            self.store.delete(&self.store_key)
        } else {
            self.store.store(&self.store_key, &bincode::serialize(record)?)
        }
    }

    /// Append an entry, creating the record on first open.
    ///
    /// `(pid, open_identity)` must be unique within the record; a
    /// duplicate is a caller bug.
    pub fn append_entry(&self, entry: ShareModeEntry) -> CoordResult<()> {
        let mut record = match self.get()? {
            Some(record) => record,
            None => ShareModeRecord::new(self.key),
        };
        if record
            .entries
            .iter()
            .any(|e| e.matches(entry.pid, entry.open_identity))
        {
            error!(
                target: "opcoord::table",
                pid = entry.pid,
                "duplicate (pid, open_identity) in share mode record"
            );
            return Err(CoordError::Corruption(format!(
                "duplicate share mode entry for pid {}",
                entry.pid
            )));
        }
        debug!(
            target: "opcoord::table",
            pid = entry.pid,
            device_id = self.key.device_id,
            inode_id = self.key.inode_id,
            oplock = ?entry.oplock,
            "appending share mode entry"
        );
        record.entries.push(entry);
        self.put(&record)
    }

    /// Remove the entry matching `(pid, open_identity)`.
    ///
    /// Idempotent: a second call returns `None`. On success the
    /// record's pending opens are drained into the result so the caller
    /// can notify them once the lock is released; if the record is now
    /// empty it is deleted.
    pub fn remove_entry(
        &self,
        pid: u32,
        identity: OpenIdentity,
    ) -> CoordResult<Option<RemovedEntry>> {
        let mut record = match self.get()? {
            Some(record) => record,
            None => return Ok(None),
        };
        let position = match record
            .entries
            .iter()
            .position(|e| e.matches(pid, identity))
        {
            Some(position) => position,
            None => return Ok(None),
        };
        let entry = record.entries.remove(position);
        let pending_opens = std::mem::take(&mut record.pending_opens);
        debug!(
            target: "opcoord::table",
            pid,
            device_id = self.key.device_id,
            inode_id = self.key.inode_id,
            remaining = record.entries.len(),
            "removed share mode entry"
        );
        self.put(&record)?;
        Ok(Some(RemovedEntry {
            entry,
            pending_opens,
        }))
    }

    /// Mutate, in place, every entry the predicate selects. Returns the
    /// number of entries modified; the record is stored back only if
    /// that is non-zero.
    ///
    /// Used for atomic oplock downgrade (predicate selects one entry)
    /// and delete-on-close toggling (predicate selects all).
    pub fn modify_entries(
        &self,
        predicate: &dyn Fn(&ShareModeEntry) -> bool,
        mutator: &dyn Fn(&mut ShareModeEntry),
    ) -> CoordResult<usize> {
        let mut record = match self.get()? {
            Some(record) => record,
            None => return Ok(0),
        };
        let mut modified = 0usize;
        for entry in record.entries.iter_mut() {
            if predicate(entry) {
                mutator(entry);
                modified += 1;
            }
        }
        if modified > 0 {
            self.put(&record)?;
        }
        Ok(modified)
    }

    /// Register a suspended open waiting for a break on this key.
    /// Requires the record to exist: a pending open only makes sense
    /// behind existing entries.
    pub fn add_pending_open(&self, pending: PendingOpen) -> CoordResult<()> {
        let mut record = match self.get()? {
            Some(record) => record,
            None => {
                return Err(CoordError::InvalidOperation(
                    "pending open on a file with no share mode record".to_string(),
                ))
            }
        };
        // At-least-once delivery makes duplicates harmless; still avoid
        // stacking them up across repeated suspensions.
        if !record
            .pending_opens
            .iter()
            .any(|p| p.retry_token == pending.retry_token)
        {
            record.pending_opens.push(pending);
            self.put(&record)?;
        }
        Ok(())
    }

    /// Remove one pending open by its retry token, once the suspended
    /// open has resolved. Idempotent: the token may already have been
    /// drained by a notification.
    pub fn remove_pending_open(&self, token: uuid::Uuid) -> CoordResult<()> {
        let mut record = match self.get()? {
            Some(record) => record,
            None => return Ok(()),
        };
        let before = record.pending_opens.len();
        record.pending_opens.retain(|p| p.retry_token != token);
        if record.pending_opens.len() != before {
            self.put(&record)?;
        }
        Ok(())
    }

    /// Drain the pending opens for notification after a downgrade that
    /// left the entries in place.
    pub fn drain_pending_opens(&self) -> CoordResult<Vec<PendingOpen>> {
        let mut record = match self.get()? {
            Some(record) => record,
            None => return Ok(Vec::new()),
        };
        let pending = std::mem::take(&mut record.pending_opens);
        if !pending.is_empty() {
            self.put(&record)?;
        }
        Ok(pending)
    }
}

impl<'a, S: RecordStore> Drop for ShareModeLock<'a, S> {
    fn drop(&mut self) {
        self.store.chainunlock(&self.store_key);
    }
}
