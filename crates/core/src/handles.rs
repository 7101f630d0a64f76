//! Per-process open-handle table.
//!
//! Each server process tracks its own client's open handles here. The
//! break executor looks handles up by filesystem identity (and, when the
//! requester supplied one, by open-time identity) because break requests
//! arrive keyed by what is in the shared record, not by any local handle
//! number.

use crate::types::{FileKey, OpenIdentity, OplockKind};
use std::collections::HashMap;

/// Process-local identifier of an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u32);

/// A local client's open handle.
#[derive(Debug, Clone)]
pub struct LocalHandle {
    /// Handle identifier
    pub id: HandleId,
    /// File the handle is open on
    pub key: FileKey,
    /// Open-time identity matching the shared entry
    pub open_identity: OpenIdentity,
    /// Oplock currently held by this handle
    pub oplock: OplockKind,
    /// Set while an oplock break notification to the client is
    /// outstanding. A second break attempt while set is a caller bug.
    pub sent_oplock_break: bool,
}

/// Table of the local client's open handles.
#[derive(Debug, Default)]
pub struct LocalHandleTable {
    handles: HashMap<HandleId, LocalHandle>,
    next_id: u32,
}

impl LocalHandleTable {
    /// Create an empty table.
    pub fn new() -> Self {
        LocalHandleTable::default()
    }

    /// Register a newly opened handle.
    pub fn insert(&mut self, key: FileKey, open_identity: OpenIdentity, oplock: OplockKind) -> HandleId {
        let id = HandleId(self.next_id);
        self.next_id += 1;
        self.handles.insert(
            id,
            LocalHandle {
                id,
                key,
                open_identity,
                oplock,
                sent_oplock_break: false,
            },
        );
        id
    }

    /// Look a handle up by id.
    pub fn get(&self, id: HandleId) -> Option<&LocalHandle> {
        self.handles.get(&id)
    }

    /// Look a handle up by id, mutably.
    pub fn get_mut(&mut self, id: HandleId) -> Option<&mut LocalHandle> {
        self.handles.get_mut(&id)
    }

    /// Remove a handle on close. Idempotent.
    pub fn remove(&mut self, id: HandleId) -> Option<LocalHandle> {
        self.handles.remove(&id)
    }

    /// Find the handle for a file key, optionally narrowed by open-time
    /// identity. With no identity given, any handle on the file matches
    /// (a break against the file is satisfiable by whichever handle
    /// still holds the oplock).
    pub fn find_by_key(&self, key: FileKey, identity: Option<OpenIdentity>) -> Option<HandleId> {
        self.handles
            .values()
            .find(|h| h.key == key && identity.map_or(true, |t| h.open_identity == t))
            .map(|h| h.id)
    }

    /// True if the handle is still present (open).
    pub fn is_open(&self, id: HandleId) -> bool {
        self.handles.contains_key(&id)
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True if no handles are open.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Iterate over all handles.
    pub fn iter(&self) -> impl Iterator<Item = &LocalHandle> {
        self.handles.values()
    }
}
