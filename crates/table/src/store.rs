//! In-memory record store backend.
//!
//! Implements the [`RecordStore`] seam for embedding and tests: a
//! concurrent map of opaque byte records plus a blocking per-key
//! advisory lock table. In production deployments the same trait fronts
//! the persistent process-shared store engine; the table layer above
//! cannot tell the difference.

use dashmap::DashMap;
use opcoord_core::error::CoordResult;
use opcoord_core::traits::RecordStore;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;

/// Process-shared in-memory store.
///
/// Chain locks are advisory and non-reentrant: locking a key twice from
/// the same thread deadlocks, exactly like taking the same keyed lock
/// twice against the persistent engine.
#[derive(Default)]
pub struct MemRecordStore {
    records: DashMap<Vec<u8>, Vec<u8>>,
    locked: Mutex<HashSet<Vec<u8>>>,
    unlocked: Condvar,
}

impl MemRecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        MemRecordStore::default()
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordStore for MemRecordStore {
    fn fetch(&self, key: &[u8]) -> CoordResult<Option<Vec<u8>>> {
        Ok(self.records.get(key).map(|entry| entry.value().clone()))
    }

    fn store(&self, key: &[u8], data: &[u8]) -> CoordResult<()> {
        self.records.insert(key.to_vec(), data.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> CoordResult<()> {
        self.records.remove(key);
        Ok(())
    }

    fn traverse(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> CoordResult<()>) -> CoordResult<()> {
        // Snapshot the key set first so the callback may mutate the
        // store (GC deletes records mid-traversal) without holding any
        // shard lock.
        let keys: Vec<Vec<u8>> = self.records.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            let value = match self.records.get(&key) {
                Some(entry) => entry.value().clone(),
                None => continue, // deleted since the snapshot
            };
            f(&key, &value)?;
        }
        Ok(())
    }

    fn chainlock(&self, key: &[u8]) {
        let mut locked = self.locked.lock();
        while locked.contains(key) {
            self.unlocked.wait(&mut locked);
        }
        locked.insert(key.to_vec());
    }

    fn chainunlock(&self, key: &[u8]) {
        let mut locked = self.locked.lock();
        locked.remove(key);
        self.unlocked.notify_all();
    }
}
