//! Peer-to-peer break messenger.
//!
//! Each process binds a private UDP socket on the loopback interface at
//! startup; the allocated port is recorded in every share-mode entry the
//! process writes, so a conflicting opener can address the owner
//! directly.
//!
//! The requester side is synchronous and bounded: send the break
//! request, then poll-receive against a total budget of
//! `break_timeout + fudge_factor`. Anything that arrives mid-wait which
//! is not our reply is dispatched through the responder path before the
//! wait resumes — two processes breaking each other concurrently would
//! otherwise deadlock. Budget exhaustion is treated as best-effort
//! success: the peer is assumed dead, and its stale entry is reclaimed
//! by the next garbage-collection sweep.

use crate::message::{BreakCommand, BreakMessage, WireError};
use opcoord_core::config::CoordConfig;
use opcoord_core::error::{CoordError, CoordResult};
use opcoord_core::types::{FileKey, OpenIdentity, PendingOpen, ShareModeEntry};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Instant;
use tracing::{debug, error, warn};

impl From<WireError> for CoordError {
    fn from(e: WireError) -> Self {
        CoordError::CorruptMessage(e.to_string())
    }
}

/// Local hooks the messenger drives when a break request must be
/// serviced in this process — either a self-break or a request arriving
/// from a peer.
pub trait BreakResponder {
    /// Break the oplock held by this process's own client on `key`.
    /// `identity` narrows the lookup to the targeted open when given.
    fn execute_local_break(
        &mut self,
        key: FileKey,
        identity: Option<OpenIdentity>,
    ) -> CoordResult<()>;

    /// True if this process currently tracks any oplocks. When false,
    /// an incoming break is moot (a racing close already released it)
    /// and is acknowledged without searching.
    fn tracks_oplocks(&self) -> bool;

    /// A retry notification arrived: opens suspended on `key` should
    /// re-run their conflict check.
    fn open_retry(&mut self, key: FileKey);
}

/// Datagram messenger for break requests and replies.
pub struct BreakMessenger {
    socket: UdpSocket,
    port: u16,
    pid: u32,
    config: CoordConfig,
}

impl BreakMessenger {
    /// Bind the process's private loopback socket on an ephemeral port.
    pub fn open(pid: u32, config: CoordConfig) -> CoordResult<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
        let port = socket.local_addr()?.port();
        debug!(target: "opcoord::wire", pid, port, "break messenger socket bound");
        Ok(BreakMessenger {
            socket,
            port,
            pid,
            config,
        })
    }

    /// The port peers should address this process on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The pid this messenger speaks for.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Request a break of `entry`'s oplock on `key`.
    ///
    /// If the entry belongs to this very process the Local Break
    /// Executor is invoked directly, never over the wire. Otherwise the
    /// peer is messaged and awaited; see the module docs for the
    /// timeout-then-proceed policy.
    pub fn request_break<R: BreakResponder>(
        &self,
        entry: &ShareModeEntry,
        key: FileKey,
        responder: &mut R,
    ) -> CoordResult<()> {
        if entry.pid == self.pid {
            // Breaking our own oplock: the entry must point back at us.
            if entry.break_port != self.port {
                error!(
                    target: "opcoord::wire",
                    pid = self.pid,
                    entry_port = entry.break_port,
                    self_port = self.port,
                    "corrupt share mode entry: own pid with foreign break port"
                );
                return Err(CoordError::Corruption(format!(
                    "share mode entry for pid {} has break port {}, expected {}",
                    entry.pid, entry.break_port, self.port
                )));
            }
            debug!(target: "opcoord::wire", pid = self.pid, "breaking our own oplock");
            return responder.execute_local_break(key, Some(entry.open_identity));
        }

        let request = BreakMessage {
            command: BreakCommand::OplockBreak,
            is_reply: false,
            requester_pid: self.pid,
            open_identity: entry.open_identity,
            key,
        };
        let peer = SocketAddrV4::new(Ipv4Addr::LOCALHOST, entry.break_port);
        self.socket
            .send_to(&request.encode(self.port, self.config.inode_width), peer)?;
        debug!(
            target: "opcoord::wire",
            peer_pid = entry.pid,
            peer_port = entry.break_port,
            device_id = key.device_id,
            inode_id = key.inode_id,
            "sent oplock break request"
        );

        let deadline = Instant::now() + self.config.peer_reply_budget();
        let mut buf = [0u8; 64];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // The peer is assumed dead or unreachable. Its client's
                // cached changes were lost anyway; proceed, and let the
                // next GC sweep reclaim the stale entry.
                warn!(
                    target: "opcoord::wire",
                    peer_pid = entry.pid,
                    peer_port = entry.break_port,
                    "no response to oplock break request; proceeding as broken"
                );
                return Ok(());
            }
            self.socket
                .set_read_timeout(Some(remaining.min(self.config.poll_interval)))?;
            let (len, _) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match BreakMessage::decode(&buf[..len], self.config.inode_width) {
                Ok((msg, src_port))
                    if request.matches_reply(&msg) && src_port == entry.break_port =>
                {
                    debug!(target: "opcoord::wire", peer_pid = entry.pid, "broke oplock");
                    return Ok(());
                }
                _ => {
                    // Not our reply: probably the peer breaking one of
                    // ours at the same time. Service it before resuming
                    // the wait so neither side deadlocks.
                    self.dispatch_incoming(&buf[..len], responder)?;
                }
            }
        }
    }

    /// Notify a suspended pending open that it should retry.
    /// Fire-and-forget, at-least-once: the retry itself is idempotent.
    pub fn notify_open_retry(&self, pending: &PendingOpen, key: FileKey) -> CoordResult<()> {
        let msg = BreakMessage {
            command: BreakCommand::OpenRetry,
            is_reply: false,
            requester_pid: self.pid,
            open_identity: OpenIdentity::new(0, 0),
            key,
        };
        let peer = SocketAddrV4::new(Ipv4Addr::LOCALHOST, pending.notify_port);
        self.socket
            .send_to(&msg.encode(self.port, self.config.inode_width), peer)?;
        debug!(
            target: "opcoord::wire",
            waiter_pid = pending.pid,
            waiter_port = pending.notify_port,
            "notified pending open"
        );
        Ok(())
    }

    /// Receive and service at most one incoming datagram, waiting up to
    /// `timeout`. Returns whether a datagram was handled. Called from
    /// the embedding server's idle loop.
    pub fn service_incoming<R: BreakResponder>(
        &self,
        responder: &mut R,
        timeout: std::time::Duration,
    ) -> CoordResult<bool> {
        if timeout.is_zero() {
            return Ok(false);
        }
        self.socket.set_read_timeout(Some(timeout))?;
        let mut buf = [0u8; 64];
        let (len, _) = match self.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        self.dispatch_incoming(&buf[..len], responder)?;
        Ok(true)
    }

    /// Responder path: dispatch one raw datagram.
    ///
    /// Malformed datagrams and unknown commands are logged and ignored,
    /// never fatal. A well-formed break request re-enters the Local
    /// Break Executor and is then echoed back with the reply bit set.
    /// Only escalation-class failures (unresponsive client, socket
    /// errors) propagate.
    fn dispatch_incoming<R: BreakResponder>(
        &self,
        buf: &[u8],
        responder: &mut R,
    ) -> CoordResult<()> {
        let (msg, src_port) = match BreakMessage::decode(buf, self.config.inode_width) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(target: "opcoord::wire", error = %e, "ignoring invalid datagram");
                return Ok(());
            }
        };

        if msg.is_reply {
            // A reply nobody is waiting for: the requester gave up
            // before we answered, or answered a duplicate. Ignore.
            error!(
                target: "opcoord::wire",
                requester_pid = msg.requester_pid,
                src_port,
                "unsolicited break reply - ignoring"
            );
            return Ok(());
        }

        match msg.command {
            BreakCommand::OplockBreak => {
                debug!(
                    target: "opcoord::wire",
                    requester_pid = msg.requester_pid,
                    src_port,
                    device_id = msg.key.device_id,
                    inode_id = msg.key.inode_id,
                    "oplock break request received"
                );
                if responder.tracks_oplocks() {
                    match responder.execute_local_break(msg.key, Some(msg.open_identity)) {
                        Ok(()) => {}
                        Err(
                            e @ (CoordError::ClientUnresponsive { .. } | CoordError::Io(_)),
                        ) => return Err(e),
                        Err(e) => {
                            // Logic failure servicing the break (e.g. a
                            // concurrent break already in flight): do
                            // not acknowledge, let the requester time
                            // out and proceed best-effort.
                            error!(
                                target: "opcoord::wire",
                                error = %e,
                                "oplock break failed - not returning reply"
                            );
                            return Ok(());
                        }
                    }
                } else {
                    debug!(
                        target: "opcoord::wire",
                        "break requested with no outstanding oplocks; replying success"
                    );
                }
                let reply = msg.into_reply();
                let to = SocketAddrV4::new(Ipv4Addr::LOCALHOST, src_port);
                self.socket
                    .send_to(&reply.encode(self.port, self.config.inode_width), to)?;
            }
            BreakCommand::OpenRetry => {
                responder.open_retry(msg.key);
            }
        }
        Ok(())
    }
}
