//! Shared harness for the coordination scenarios.
//!
//! Each "process" is an `OplockCoordinator` over the same shared
//! `MemRecordStore`, with its own scripted connection double and a
//! controllable liveness probe standing in for the OS.

use opcoord::{
    AccessMask, ConnectionRuntime, CoordConfig, CoordResult, HandleId, LocalHandleTable,
    MemRecordStore, OpenDisposition, OpenRequest, OplockCoordinator, OplockKind, ProcessProbe,
    ShareAccess,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Liveness probe backed by a shared, mutable pid set.
#[derive(Clone)]
pub struct LivenessMap {
    live: Arc<Mutex<HashSet<u32>>>,
}

impl LivenessMap {
    pub fn with(pids: &[u32]) -> Self {
        LivenessMap {
            live: Arc::new(Mutex::new(pids.iter().copied().collect())),
        }
    }

    pub fn kill(&self, pid: u32) {
        self.live.lock().remove(&pid);
    }

    pub fn spawn(&self, pid: u32) {
        self.live.lock().insert(pid);
    }
}

impl ProcessProbe for LivenessMap {
    fn process_exists(&self, pid: u32) -> bool {
        self.live.lock().contains(&pid)
    }
}

/// Connection double: the client acknowledges every break by
/// downgrading the released handle to `ack_to` on the next pump.
pub struct AckingConn {
    pub ack_to: OplockKind,
    pub released: Vec<HandleId>,
}

impl AckingConn {
    pub fn new(ack_to: OplockKind) -> Self {
        AckingConn {
            ack_to,
            released: Vec::new(),
        }
    }
}

impl ConnectionRuntime for AckingConn {
    fn send_oplock_release(&mut self, handle: HandleId) -> CoordResult<()> {
        self.released.push(handle);
        Ok(())
    }

    fn pump_next_request(
        &mut self,
        handles: &mut LocalHandleTable,
        _timeout: Duration,
    ) -> CoordResult<()> {
        if let Some(&id) = self.released.last() {
            if let Some(h) = handles.get_mut(id) {
                h.oplock = self.ack_to;
            }
        }
        Ok(())
    }
}

/// Short timeouts so a scenario that exercises the timeout path stays
/// fast.
pub fn fast_config() -> CoordConfig {
    CoordConfig {
        break_timeout: Duration::from_millis(300),
        fudge_factor: Duration::from_millis(60),
        poll_interval: Duration::from_millis(10),
        ..CoordConfig::default()
    }
}

pub fn start_process(
    store: Arc<MemRecordStore>,
    probe: &dyn ProcessProbe,
    pid: u32,
) -> OplockCoordinator<MemRecordStore> {
    OplockCoordinator::start(store, probe, pid, fast_config()).unwrap()
}

/// A data-bearing open asking for a Batch oplock, deny-none.
pub fn batch_request() -> OpenRequest {
    OpenRequest {
        access_mask: AccessMask::READ_DATA | AccessMask::WRITE_DATA,
        share_access: ShareAccess::DENY_NONE,
        disposition: OpenDisposition::OpenIf,
        requested_oplock: OplockKind::Batch,
        delete_on_close: false,
    }
}

/// A data-bearing open with no oplock interest.
pub fn plain_request() -> OpenRequest {
    OpenRequest {
        requested_oplock: OplockKind::None,
        ..batch_request()
    }
}
