//! Configuration consumed by the coordination system.
//!
//! The values are owned by the embedding server's configuration layer;
//! this struct is the subset the coordinator, messenger and executor
//! consume.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Width of the inode component of a file key on the wire.
///
/// Chosen once at configuration time for a fleet of interoperating
/// processes; never inferred from message data at runtime. The inode is
/// split across two 32-bit words in the wide variant so the layout stays
/// portable across builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeWidth {
    /// 32-bit inodes, one wire word
    U32,
    /// 64-bit inodes, two wire words (low word first)
    U64,
}

/// Tunables for break handling and the share-mode table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordConfig {
    /// How long a client or peer gets to acknowledge a break
    pub break_timeout: Duration,
    /// Slack added to `break_timeout` when awaiting a *peer's* reply,
    /// covering the peer's own client round-trip
    pub fudge_factor: Duration,
    /// Per-iteration receive timeout in the messenger's wait loop, so
    /// interleaved incoming requests are serviced promptly
    pub poll_interval: Duration,
    /// Whether oplocks are granted at all
    pub oplocks_enabled: bool,
    /// Wire width of inode numbers
    pub inode_width: InodeWidth,
}

impl Default for CoordConfig {
    fn default() -> Self {
        CoordConfig {
            break_timeout: Duration::from_secs(30),
            fudge_factor: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            oplocks_enabled: true,
            inode_width: InodeWidth::U64,
        }
    }
}

impl CoordConfig {
    /// Total budget for awaiting a peer's break reply.
    pub fn peer_reply_budget(&self) -> Duration {
        self.break_timeout + self.fudge_factor
    }
}
