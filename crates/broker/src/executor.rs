//! Local break executor.
//!
//! Breaks an oplock held by this process's own client: notify the
//! client, then pump the connection's normal request loop until the
//! client's acknowledgement clears the oplock as a side effect of
//! ordinary processing, bounded by `break_timeout`.
//!
//! States: lookup, notify, await-ack, then downgraded / closed /
//! timed-out. The timed-out arm is deliberately fatal
//! ([`CoordError::ClientUnresponsive`]): a client whose cache state is
//! unknown cannot be served further, and the embedding process is
//! expected to tear down and exit rather than limp along.

use crate::runtime::OplockRuntime;
use opcoord_core::error::{CoordError, CoordResult};
use opcoord_core::handles::{HandleId, LocalHandleTable};
use opcoord_core::traits::{ConnectionRuntime, RecordStore};
use opcoord_core::types::{FileKey, OpenIdentity, OplockKind};
use opcoord_table::ShareModeTable;
use opcoord_wire::BreakMessenger;
use std::time::Instant;
use tracing::{debug, error, warn};

/// How a break attempt resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakOutcome {
    /// No local handle for the key: a racing close already released
    /// the oplock. Success.
    NotFound,
    /// The handle holds no oplock: already broken by a race. Success.
    NoOplock,
    /// The client acknowledged and the handle now holds this kind.
    Downgraded(OplockKind),
    /// The client responded by closing the handle. The close path owns
    /// the table update and counter decrement.
    Closed,
}

/// One break execution against this process's handle table. Borrows
/// the per-process machinery for the duration of the call; construct
/// at the call site.
pub struct BreakExecutor<'a, S: RecordStore, C: ConnectionRuntime> {
    /// Per-process runtime state
    pub runtime: &'a mut OplockRuntime,
    /// This process's open handles
    pub handles: &'a mut LocalHandleTable,
    /// Shared share-mode table
    pub table: &'a ShareModeTable<S>,
    /// The owning client's connection
    pub conn: &'a mut C,
    /// Messenger, for waking pending opens after a downgrade
    pub messenger: &'a BreakMessenger,
}

impl<'a, S: RecordStore, C: ConnectionRuntime> BreakExecutor<'a, S, C> {
    /// Break the oplock on `key`, narrowed to one open when `identity`
    /// is given.
    ///
    /// Must not be called while this handle already has a break in
    /// flight; a second concurrent break on one handle is a caller bug
    /// and fails with [`CoordError::BreakInProgress`], never silently
    /// merged.
    pub fn execute(
        &mut self,
        key: FileKey,
        identity: Option<OpenIdentity>,
    ) -> CoordResult<BreakOutcome> {
        let id = match self.handles.find_by_key(key, identity) {
            Some(id) => id,
            None => {
                debug!(
                    target: "opcoord::broker",
                    device_id = key.device_id,
                    inode_id = key.inode_id,
                    "break requested for a file we no longer have open"
                );
                return Ok(BreakOutcome::NotFound);
            }
        };
        let open_identity = match self.handles.get(id) {
            Some(handle) => {
                if !handle.oplock.exists() {
                    debug!(
                        target: "opcoord::broker",
                        handle = handle.id.0,
                        "break requested but oplock already gone"
                    );
                    return Ok(BreakOutcome::NoOplock);
                }
                if handle.sent_oplock_break {
                    error!(
                        target: "opcoord::broker",
                        handle = handle.id.0,
                        "second break attempted while one is in flight"
                    );
                    return Err(CoordError::BreakInProgress { key });
                }
                handle.open_identity
            }
            None => return Ok(BreakOutcome::NotFound),
        };

        self.conn.send_oplock_release(id)?;
        if let Some(handle) = self.handles.get_mut(id) {
            handle.sent_oplock_break = true;
        }
        debug!(
            target: "opcoord::broker",
            handle = id.0,
            device_id = key.device_id,
            inode_id = key.inode_id,
            "oplock release sent to client"
        );

        self.runtime.begin_break();
        let waited = self.await_ack(id);
        self.runtime.end_break()?;
        let outcome = waited?;

        if let Some(handle) = self.handles.get_mut(id) {
            handle.sent_oplock_break = false;
        }
        if let BreakOutcome::Downgraded(kind) = outcome {
            self.runtime.note_oplock_released()?;
            self.record_downgrade(key, open_identity, kind)?;
        }
        Ok(outcome)
    }

    /// Pump the connection until the client's acknowledgement shows up
    /// in the handle table, or the budget runs out.
    fn await_ack(&mut self, id: HandleId) -> CoordResult<BreakOutcome> {
        let timeout = self.runtime.config().break_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            if !self.conn.is_handle_open(self.handles, id) {
                debug!(target: "opcoord::broker", handle = id.0, "client closed during break");
                return Ok(BreakOutcome::Closed);
            }
            if let Some(handle) = self.handles.get(id) {
                if !handle.oplock.is_exclusive_level() {
                    return Ok(BreakOutcome::Downgraded(handle.oplock));
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                error!(
                    target: "opcoord::broker",
                    handle = id.0,
                    ?timeout,
                    "client failed to acknowledge oplock break"
                );
                return Err(CoordError::ClientUnresponsive { timeout });
            }
            if let Err(e) = self.conn.pump_next_request(self.handles, remaining) {
                error!(
                    target: "opcoord::broker",
                    handle = id.0,
                    error = %e,
                    "connection failed while awaiting break acknowledgement"
                );
                return Err(CoordError::ClientUnresponsive { timeout });
            }
        }
    }

    /// Write the downgraded kind into the shared entry and wake the
    /// opens suspended behind it. Idempotent: the client-driven path may
    /// already have written the same value.
    fn record_downgrade(
        &mut self,
        key: FileKey,
        identity: OpenIdentity,
        kind: OplockKind,
    ) -> CoordResult<()> {
        let pid = self.runtime.pid();
        let pending = {
            let lock = self.table.lock(key);
            lock.modify_entries(&|e| e.matches(pid, identity), &|e| e.oplock = kind)?;
            lock.drain_pending_opens()?
        };
        for p in &pending {
            if let Err(e) = self.messenger.notify_open_retry(p, key) {
                warn!(
                    target: "opcoord::broker",
                    waiter_pid = p.pid,
                    error = %e,
                    "failed to notify pending open after downgrade"
                );
            }
        }
        Ok(())
    }

    /// Last-ditch break of an oplocked handle to free table space.
    /// Returns whether a break was actually run.
    pub fn attempt_close(&mut self, id: HandleId) -> CoordResult<bool> {
        let (key, identity) = match self.handles.get(id) {
            Some(h) if h.oplock.is_exclusive_level() && !h.sent_oplock_break => {
                (h.key, h.open_identity)
            }
            _ => return Ok(false),
        };
        warn!(
            target: "opcoord::broker",
            handle = id.0,
            "forcing oplock break to release resources"
        );
        let outcome = self.execute(key, Some(identity))?;
        Ok(matches!(
            outcome,
            BreakOutcome::Downgraded(_) | BreakOutcome::Closed
        ))
    }
}
