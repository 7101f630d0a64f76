//! Open/close coordination: the share-mode conflict decision and the
//! driver that resolves `BreakRequired` outcomes by messaging the
//! conflicting holders.
//!
//! The conflict decision itself ([`decide_open`]) is a pure function,
//! always executed with the key's chain lock held and never blocking.
//! When it reports that exclusive oplocks stand in the way, the driver
//! registers a pending open under the same lock, releases it, breaks
//! each conflicting entry through the messenger (bounded, best-effort),
//! and re-runs the decision. Entries already best-effort-broken in this
//! attempt count as broken on the re-run, so a dead peer's stale entry
//! cannot loop the driver forever.

use crate::executor::BreakExecutor;
use crate::runtime::OplockRuntime;
use opcoord_core::access::{is_attributes_only, AccessMask, OpenDisposition, ShareAccess};
use opcoord_core::config::CoordConfig;
use opcoord_core::error::{CoordError, CoordResult};
use opcoord_core::handles::{HandleId, LocalHandleTable};
use opcoord_core::traits::{ConnectionRuntime, ProcessProbe, RecordStore};
use opcoord_core::types::{
    FileKey, OpenIdentity, OplockKind, PendingOpen, ShareModeEntry, ShareModeRecord,
};
use opcoord_table::ShareModeTable;
use opcoord_wire::{BreakMessenger, BreakResponder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// What an open asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    /// Rights requested
    pub access_mask: AccessMask,
    /// Access permitted to other opens
    pub share_access: ShareAccess,
    /// Create/open/truncate behaviour
    pub disposition: OpenDisposition,
    /// Oplock the client would like
    pub requested_oplock: OplockKind,
    /// Whether the open requests delete-on-close
    pub delete_on_close: bool,
}

/// Outcome of the conflict decision for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenDecision {
    /// No conflict; the open may proceed with this oplock.
    Granted(OplockKind),
    /// These exclusive-level holders must be broken first. Never
    /// resolved inline under the lock.
    BreakRequired(Vec<ShareModeEntry>),
}

/// A successfully opened handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenGrant {
    /// The new local handle
    pub handle: HandleId,
    /// The oplock granted with it
    pub oplock: OplockKind,
}

/// The pairwise right/share checks: a requested right on one side
/// conflicts with a missing allow bit on the other, in either
/// direction.
const SHARE_CHECKS: [(AccessMask, ShareAccess); 3] = [
    (
        AccessMask::WRITE_DATA.union(AccessMask::APPEND_DATA),
        ShareAccess::WRITE,
    ),
    (
        AccessMask::READ_DATA.union(AccessMask::EXECUTE),
        ShareAccess::READ,
    ),
    (AccessMask::DELETE, ShareAccess::DELETE),
];

/// Symmetric sharing check between two opens.
pub fn share_conflict(
    a_access: AccessMask,
    a_share: ShareAccess,
    b_access: AccessMask,
    b_share: ShareAccess,
) -> bool {
    SHARE_CHECKS.iter().any(|&(right, allow)| {
        (a_access.intersects(right) && !b_share.contains(allow))
            || (b_access.intersects(right) && !a_share.contains(allow))
    })
}

/// Decide whether an open may proceed against the current record.
///
/// Pure; the caller holds the key's chain lock. `already_broken` lists
/// `(pid, open_identity)` pairs this open attempt has already
/// best-effort-broken; their entries are treated as resolved even if
/// still present (a timed-out peer's entry stays until GC).
///
/// Breaks take precedence over sharing violations: the sharing check is
/// re-run once the breaks resolve, against whatever state they left.
pub fn decide_open(
    record: Option<&ShareModeRecord>,
    request: &OpenRequest,
    config: &CoordConfig,
    already_broken: &[(u32, OpenIdentity)],
) -> CoordResult<OpenDecision> {
    let entries: &[ShareModeEntry] = record.map_or(&[], |r| r.entries.as_slice());

    if record.is_some_and(|r| r.delete_pending()) {
        return Err(CoordError::DeletePending);
    }
    if request.delete_on_close && !entries.is_empty() {
        return Err(CoordError::SharingViolation);
    }

    if !is_attributes_only(request.access_mask, request.disposition) {
        let targets: Vec<ShareModeEntry> = entries
            .iter()
            .filter(|e| {
                e.oplock.is_exclusive_level()
                    && !already_broken.contains(&(e.pid, e.open_identity))
            })
            .cloned()
            .collect();
        if !targets.is_empty() {
            return Ok(OpenDecision::BreakRequired(targets));
        }
    }

    for entry in entries {
        if share_conflict(
            entry.access_mask,
            entry.share_access,
            request.access_mask,
            request.share_access,
        ) {
            return Err(CoordError::SharingViolation);
        }
    }

    let granted = if !config.oplocks_enabled {
        OplockKind::None
    } else {
        match request.requested_oplock {
            OplockKind::None => OplockKind::None,
            OplockKind::LevelII => OplockKind::LevelII,
            kind @ (OplockKind::Exclusive | OplockKind::Batch) => {
                if entries.is_empty() {
                    kind
                } else {
                    OplockKind::LevelII
                }
            }
        }
    };
    Ok(OpenDecision::Granted(granted))
}

/// Responder wiring: break requests arriving at this process (over the
/// wire or as self-breaks) re-enter the local executor; retry
/// notifications are collected for the embedding loop.
struct LocalResponder<'a, S: RecordStore, C: ConnectionRuntime> {
    runtime: &'a mut OplockRuntime,
    handles: &'a mut LocalHandleTable,
    table: &'a ShareModeTable<S>,
    conn: &'a mut C,
    messenger: &'a BreakMessenger,
    retried: Vec<FileKey>,
}

impl<'a, S: RecordStore, C: ConnectionRuntime> BreakResponder for LocalResponder<'a, S, C> {
    fn execute_local_break(
        &mut self,
        key: FileKey,
        identity: Option<OpenIdentity>,
    ) -> CoordResult<()> {
        let mut executor = BreakExecutor {
            runtime: &mut *self.runtime,
            handles: &mut *self.handles,
            table: self.table,
            conn: &mut *self.conn,
            messenger: self.messenger,
        };
        executor.execute(key, identity).map(|_| ())
    }

    fn tracks_oplocks(&self) -> bool {
        self.runtime.tracks_oplocks()
    }

    fn open_retry(&mut self, key: FileKey) {
        self.retried.push(key);
    }
}

/// Per-process coordination front end: owns the share-mode table view,
/// the break messenger, the handle table and the runtime context.
pub struct OplockCoordinator<S: RecordStore> {
    table: ShareModeTable<S>,
    messenger: BreakMessenger,
    runtime: OplockRuntime,
    handles: LocalHandleTable,
}

impl<S: RecordStore> OplockCoordinator<S> {
    /// Bring the process's coordination machinery up: bind the break
    /// socket, open the table (running the startup reconciliation
    /// sweep), build the runtime context.
    pub fn start(
        store: Arc<S>,
        probe: &dyn ProcessProbe,
        pid: u32,
        config: CoordConfig,
    ) -> CoordResult<Self> {
        let messenger = BreakMessenger::open(pid, config.clone())?;
        let table = ShareModeTable::open(store, probe, pid)?;
        let runtime = OplockRuntime::new(pid, messenger.port(), config);
        Ok(OplockCoordinator {
            table,
            messenger,
            runtime,
            handles: LocalHandleTable::new(),
        })
    }

    /// Final sweep before process exit; returns entries reclaimed. Any
    /// reclaimed entry owned by this process is a leak and was logged.
    pub fn shutdown(&self, probe: &dyn ProcessProbe) -> CoordResult<usize> {
        self.table.shutdown(probe)
    }

    /// This process's runtime context.
    pub fn runtime(&self) -> &OplockRuntime {
        &self.runtime
    }

    /// Mutable runtime context, for the embedding dispatcher's
    /// defer/drain cycle.
    pub fn runtime_mut(&mut self) -> &mut OplockRuntime {
        &mut self.runtime
    }

    /// This process's open handles.
    pub fn handles(&self) -> &LocalHandleTable {
        &self.handles
    }

    /// The shared table view, for diagnostics (`forall`) and tests.
    pub fn table(&self) -> &ShareModeTable<S> {
        &self.table
    }

    /// The port peers address this process's breaks to.
    pub fn port(&self) -> u16 {
        self.runtime.port()
    }

    /// Open a file, resolving share-mode conflicts and oplock breaks.
    ///
    /// Returns the granted handle, or [`CoordError::SharingViolation`] /
    /// [`CoordError::DeletePending`] as conflict outcomes. Break
    /// resolution is synchronous and bounded by the per-entry reply
    /// budget; an unresponsive peer is assumed dead and skipped.
    pub fn open_file<C: ConnectionRuntime>(
        &mut self,
        conn: &mut C,
        key: FileKey,
        open_identity: OpenIdentity,
        request: &OpenRequest,
    ) -> CoordResult<OpenGrant> {
        let retry_token = Uuid::new_v4();
        let mut registered = false;
        let result = self.drive_open(conn, key, open_identity, request, retry_token, &mut registered);
        if registered {
            let lock = self.table.lock(key);
            if let Err(e) = lock.remove_pending_open(retry_token) {
                warn!(
                    target: "opcoord::broker",
                    error = %e,
                    "failed to clear pending open registration"
                );
            }
        }
        result
    }

    fn drive_open<C: ConnectionRuntime>(
        &mut self,
        conn: &mut C,
        key: FileKey,
        open_identity: OpenIdentity,
        request: &OpenRequest,
        retry_token: Uuid,
        registered: &mut bool,
    ) -> CoordResult<OpenGrant> {
        let mut broken: Vec<(u32, OpenIdentity)> = Vec::new();
        loop {
            let targets = {
                let lock = self.table.lock(key);
                let record = lock.get()?;
                match decide_open(record.as_ref(), request, self.runtime.config(), &broken)? {
                    OpenDecision::Granted(kind) => {
                        lock.append_entry(ShareModeEntry {
                            pid: self.runtime.pid(),
                            access_mask: request.access_mask,
                            share_access: request.share_access,
                            oplock: kind,
                            break_port: self.runtime.port(),
                            open_identity,
                            delete_on_close: request.delete_on_close,
                        })?;
                        if kind.is_exclusive_level() {
                            self.runtime.note_oplock_granted();
                        }
                        let handle = self.handles.insert(key, open_identity, kind);
                        debug!(
                            target: "opcoord::broker",
                            handle = handle.0,
                            device_id = key.device_id,
                            inode_id = key.inode_id,
                            oplock = ?kind,
                            "open granted"
                        );
                        return Ok(OpenGrant {
                            handle,
                            oplock: kind,
                        });
                    }
                    OpenDecision::BreakRequired(targets) => {
                        if !*registered {
                            lock.add_pending_open(PendingOpen {
                                pid: self.runtime.pid(),
                                notify_port: self.runtime.port(),
                                retry_token,
                            })?;
                            *registered = true;
                        }
                        targets
                    }
                }
            };

            for entry in &targets {
                let mut responder = LocalResponder {
                    runtime: &mut self.runtime,
                    handles: &mut self.handles,
                    table: &self.table,
                    conn: &mut *conn,
                    messenger: &self.messenger,
                    retried: Vec::new(),
                };
                self.messenger.request_break(entry, key, &mut responder)?;
                broken.push((entry.pid, entry.open_identity));
            }
        }
    }

    /// Close a handle: remove its shared entry, release its oplock
    /// accounting and wake any opens suspended behind it. Idempotent in
    /// the handle.
    pub fn close_file(&mut self, id: HandleId) -> CoordResult<()> {
        let handle = match self.handles.remove(id) {
            Some(handle) => handle,
            None => return Ok(()),
        };
        if handle.oplock.is_exclusive_level() {
            self.runtime.note_oplock_released()?;
        }
        let removed = {
            let lock = self.table.lock(handle.key);
            lock.remove_entry(self.runtime.pid(), handle.open_identity)?
        };
        match removed {
            None => {
                // GC may legitimately have raced us only if our pid
                // died, so a missing entry here is bookkeeping skew.
                error!(
                    target: "opcoord::broker",
                    handle = id.0,
                    device_id = handle.key.device_id,
                    inode_id = handle.key.inode_id,
                    "no share mode entry found for closing handle"
                );
            }
            Some(removed) => {
                debug!(
                    target: "opcoord::broker",
                    handle = id.0,
                    pending = removed.pending_opens.len(),
                    "handle closed"
                );
                for pending in &removed.pending_opens {
                    if let Err(e) = self.messenger.notify_open_retry(pending, handle.key) {
                        warn!(
                            target: "opcoord::broker",
                            waiter_pid = pending.pid,
                            error = %e,
                            "failed to notify pending open on close"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Toggle delete-on-close across every entry of the handle's file.
    pub fn set_delete_on_close(&mut self, id: HandleId, value: bool) -> CoordResult<()> {
        let key = match self.handles.get(id) {
            Some(handle) => handle.key,
            None => {
                return Err(CoordError::InvalidOperation(
                    "delete-on-close on an unknown handle".to_string(),
                ))
            }
        };
        let lock = self.table.lock(key);
        let modified = lock.modify_entries(&|_| true, &|e| e.delete_on_close = value)?;
        if modified == 0 {
            return Err(CoordError::InvalidOperation(
                "delete-on-close on a file with no share mode record".to_string(),
            ));
        }
        debug!(
            target: "opcoord::broker",
            handle = id.0,
            value,
            modified,
            "delete-on-close toggled"
        );
        Ok(())
    }

    /// Service at most one incoming datagram (break request or retry
    /// notification), waiting up to `timeout`. Returns the keys of
    /// retry notifications received, for the embedding loop to re-drive
    /// its suspended opens.
    pub fn service_incoming<C: ConnectionRuntime>(
        &mut self,
        conn: &mut C,
        timeout: Duration,
    ) -> CoordResult<Vec<FileKey>> {
        let mut responder = LocalResponder {
            runtime: &mut self.runtime,
            handles: &mut self.handles,
            table: &self.table,
            conn,
            messenger: &self.messenger,
            retried: Vec::new(),
        };
        self.messenger.service_incoming(&mut responder, timeout)?;
        Ok(responder.retried)
    }
}
