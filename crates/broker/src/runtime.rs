//! Per-process runtime context for oplock handling.
//!
//! One [`OplockRuntime`] exists per server process. It carries the
//! process identity, the messenger port peers address breaks to, the
//! count of exclusive-level oplocks currently held, the break-in-flight
//! depth, and the queue of requests deferred while a break awaits its
//! acknowledgement. Constructed at process start and injected into the
//! coordinator and executor; nothing here is global.

use opcoord_core::config::CoordConfig;
use opcoord_core::error::{CoordError, CoordResult};
use std::collections::VecDeque;
use tracing::{debug, error};

/// Coarse classification of an incoming request, used to decide whether
/// it may run while an oplock break is awaiting acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Opens a file; may recurse into the coordinator
    Open,
    /// Renames a file; may invalidate keys mid-break
    Rename,
    /// Deletes a file; may invalidate keys mid-break
    Delete,
    /// Anything else (reads, writes, metadata queries)
    Other,
}

impl RequestClass {
    /// True for request kinds that must not run while a break is in
    /// flight: they could recurse into the coordinator or invalidate
    /// the file the break targets.
    pub fn is_dangerous(&self) -> bool {
        !matches!(self, RequestClass::Other)
    }
}

/// A request the dispatcher parked while a break was in flight. The
/// payload is the embedding server's own encoding; this layer only
/// holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredRequest {
    /// Why the request was deferred
    pub class: RequestClass,
    /// Opaque request bytes, replayed by the embedding dispatcher
    pub payload: Vec<u8>,
}

/// Mutable per-process state for oplock coordination.
#[derive(Debug)]
pub struct OplockRuntime {
    pid: u32,
    port: u16,
    oplocks_open: i64,
    break_depth: u32,
    deferred: VecDeque<DeferredRequest>,
    config: CoordConfig,
}

impl OplockRuntime {
    /// Create the runtime for a process whose messenger is bound on
    /// `port`.
    pub fn new(pid: u32, port: u16, config: CoordConfig) -> Self {
        OplockRuntime {
            pid,
            port,
            oplocks_open: 0,
            break_depth: 0,
            deferred: VecDeque::new(),
            config,
        }
    }

    /// This process's pid.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The loopback port recorded in this process's share-mode entries.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Configuration in effect.
    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    /// True while any break on this process's handles awaits its
    /// client acknowledgement. Nested breaks (an incoming break serviced
    /// mid-wait) stack.
    pub fn break_in_flight(&self) -> bool {
        self.break_depth > 0
    }

    /// Enter a break wait.
    pub fn begin_break(&mut self) {
        self.break_depth += 1;
    }

    /// Leave a break wait. An unbalanced call is a bug in the executor.
    pub fn end_break(&mut self) -> CoordResult<()> {
        match self.break_depth.checked_sub(1) {
            Some(depth) => {
                self.break_depth = depth;
                Ok(())
            }
            None => {
                error!(
                    target: "opcoord::broker",
                    pid = self.pid,
                    "break depth underflow"
                );
                Err(CoordError::Corruption("break depth underflow".to_string()))
            }
        }
    }

    /// True if this process currently holds any exclusive-level oplock.
    /// Level II grants are not counted: only exclusive levels are ever
    /// the target of a break request.
    pub fn tracks_oplocks(&self) -> bool {
        self.oplocks_open > 0
    }

    /// Number of exclusive-level oplocks held.
    pub fn oplocks_open(&self) -> i64 {
        self.oplocks_open
    }

    /// Account for a newly granted exclusive-level oplock.
    pub fn note_oplock_granted(&mut self) {
        self.oplocks_open += 1;
        debug!(
            target: "opcoord::broker",
            pid = self.pid,
            oplocks_open = self.oplocks_open,
            "oplock granted"
        );
    }

    /// Account for a broken or closed exclusive-level oplock. A
    /// negative count means grant/release bookkeeping diverged.
    pub fn note_oplock_released(&mut self) -> CoordResult<()> {
        self.oplocks_open -= 1;
        if self.oplocks_open < 0 {
            error!(
                target: "opcoord::broker",
                pid = self.pid,
                oplocks_open = self.oplocks_open,
                "oplock counter went negative"
            );
            return Err(CoordError::Corruption(format!(
                "oplock counter for pid {} went negative",
                self.pid
            )));
        }
        debug!(
            target: "opcoord::broker",
            pid = self.pid,
            oplocks_open = self.oplocks_open,
            "oplock released"
        );
        Ok(())
    }

    /// True if a request of this class must be queued instead of
    /// executed right now.
    pub fn should_defer(&self, class: RequestClass) -> bool {
        self.break_in_flight() && class.is_dangerous()
    }

    /// Park a request until the break completes.
    pub fn defer(&mut self, request: DeferredRequest) {
        debug!(
            target: "opcoord::broker",
            pid = self.pid,
            class = ?request.class,
            "deferring request during oplock break"
        );
        self.deferred.push_back(request);
    }

    /// Take the parked requests, in arrival order, for replay by the
    /// dispatcher once no break is in flight.
    pub fn drain_deferred(&mut self) -> Vec<DeferredRequest> {
        self.deferred.drain(..).collect()
    }
}
