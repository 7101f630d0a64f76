//! Traits behind which the external collaborators live.
//!
//! The record store engine, the OS process probe and the per-connection
//! protocol runtime are all owned elsewhere; the coordination system
//! only depends on these seams so back-ends can be swapped (persistent
//! store vs. in-memory, real server loop vs. test double) without
//! touching the upper layers.

use crate::error::CoordResult;
use crate::handles::{HandleId, LocalHandleTable};
use std::time::Duration;

/// Process-shared keyed byte store with per-key advisory locking.
///
/// Keys and values are opaque bytes; the table layer owns their
/// encoding. All read-modify-write sequences on a key require its chain
/// lock held. Implementations must be safe to share between the threads
/// of a test harness standing in for separate processes
/// (`Send + Sync`).
pub trait RecordStore: Send + Sync {
    /// Fetch the bytes stored under a key. Absent is not an error.
    fn fetch(&self, key: &[u8]) -> CoordResult<Option<Vec<u8>>>;

    /// Store bytes under a key, replacing any previous value.
    fn store(&self, key: &[u8], data: &[u8]) -> CoordResult<()>;

    /// Delete a key. Deleting an absent key is not an error.
    fn delete(&self, key: &[u8]) -> CoordResult<()>;

    /// Visit every key/value pair in the store. The callback must not
    /// assume any ordering. Mutation during traversal is permitted only
    /// for the key the callback currently holds the chain lock for.
    fn traverse(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> CoordResult<()>) -> CoordResult<()>;

    /// Acquire the advisory chain lock for a key, blocking until it is
    /// available.
    fn chainlock(&self, key: &[u8]);

    /// Release the advisory chain lock for a key.
    fn chainunlock(&self, key: &[u8]);
}

/// OS-level dead-process detection, used by garbage collection to
/// reclaim entries owned by processes that died without cleaning up.
pub trait ProcessProbe: Send + Sync {
    /// True if a process with this pid currently exists.
    fn process_exists(&self, pid: u32) -> bool;
}

/// The per-connection protocol runtime: delivers protocol messages to
/// this process's client and pumps the connection's single-threaded
/// request loop.
///
/// `pump_next_request` is the executor's suspension point: while
/// awaiting a client's break acknowledgement, the normal request loop
/// keeps running so unrelated traffic (and even a nested incoming break)
/// is still serviced. Processing a request may mutate the handle table,
/// which is how a client acknowledgement clears the oplock as a side
/// effect of normal processing.
pub trait ConnectionRuntime {
    /// Send an oplock-release notification for a handle to the client.
    fn send_oplock_release(&mut self, handle: HandleId) -> CoordResult<()>;

    /// Receive and process the connection's next request, waiting at
    /// most `timeout`. A timeout is an error: during a break wait the
    /// client is expected to keep talking.
    fn pump_next_request(
        &mut self,
        handles: &mut LocalHandleTable,
        timeout: Duration,
    ) -> CoordResult<()>;

    /// True if the handle is still open from the connection's point of
    /// view. Defaults to the handle table's view.
    fn is_handle_open(&self, handles: &LocalHandleTable, handle: HandleId) -> bool {
        handles.is_open(handle)
    }
}
