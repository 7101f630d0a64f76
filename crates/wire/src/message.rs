//! Break message codec.
//!
//! # Format
//!
//! ```text
//! Datagram layout (all fields little-endian):
//! ┌────────────────────┬───────────────────┬──────────────────────────┐
//! │ total_length (u32) │ source_port (u16) │ body (total_length bytes)│
//! └────────────────────┴───────────────────┴──────────────────────────┘
//!
//! Body layout:
//! ┌─────────────┬─────────────┬──────┬───────┬──────┬────────────────┐
//! │ command u16 │ req_pid u32 │ sec  │ usec  │ dev  │ inode 1–2 words│
//! └─────────────┴─────────────┴──────┴───────┴──────┴────────────────┘
//! ```
//!
//! The top bit of `command` marks a reply. The inode occupies one or two
//! 32-bit words depending on the configured [`InodeWidth`]; the wide
//! variant stores the low word first. Width is a codec parameter fixed
//! at configuration time for the whole fleet, never inferred from the
//! bytes on the wire.

use opcoord_core::config::InodeWidth;
use opcoord_core::types::{FileKey, OpenIdentity};
use thiserror::Error;

/// Length of the datagram header: `total_length:u32 ++ source_port:u16`.
pub const UDP_HEADER_LEN: usize = 6;

/// Reply bit OR'ed into the command word when echoing a request back.
pub const CMD_REPLY: u16 = 0x8000;

const CMD_OPLOCK_BREAK: u16 = 0x0001;
const CMD_OPEN_RETRY: u16 = 0x0002;

/// Wire commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakCommand {
    /// Request the addressee to break its oplock on a file
    OplockBreak,
    /// Wake a suspended pending open so it re-runs its conflict check.
    /// Fire-and-forget: no reply is expected.
    OpenRetry,
}

impl BreakCommand {
    fn to_wire(self) -> u16 {
        match self {
            BreakCommand::OplockBreak => CMD_OPLOCK_BREAK,
            BreakCommand::OpenRetry => CMD_OPEN_RETRY,
        }
    }

    fn from_wire(raw: u16) -> Option<Self> {
        match raw {
            CMD_OPLOCK_BREAK => Some(BreakCommand::OplockBreak),
            CMD_OPEN_RETRY => Some(BreakCommand::OpenRetry),
            _ => None,
        }
    }
}

/// Codec failures for received datagrams.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Datagram shorter than its header or declared body length
    #[error("datagram truncated: have {have} bytes, need {need}")]
    Truncated {
        /// Bytes available
        have: usize,
        /// Bytes required
        need: usize,
    },

    /// Body length does not match the fixed message size for the width
    #[error("bad body length: was {was}, should be {should}")]
    BadLength {
        /// Declared body length
        was: usize,
        /// Expected body length
        should: usize,
    },

    /// Command code this generation does not know.
    /// Logged and ignored by the responder, never fatal.
    #[error("unknown command code {0:#06x}")]
    UnknownCommand(u16),
}

/// Read a little-endian u16 at `offset`. Caller has bounds-checked.
fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap())
}

/// Read a little-endian u32 at `offset`. Caller has bounds-checked.
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

/// A break-protocol message (transient, wire-only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakMessage {
    /// What the sender wants
    pub command: BreakCommand,
    /// Whether this is the echo of a request
    pub is_reply: bool,
    /// Pid of the process that initiated the exchange
    pub requester_pid: u32,
    /// Open-time identity of the targeted entry
    pub open_identity: OpenIdentity,
    /// File the exchange concerns
    pub key: FileKey,
}

impl BreakMessage {
    /// Fixed body length for the given inode width.
    pub fn body_len(width: InodeWidth) -> usize {
        // command + pid + sec + usec + dev
        let fixed = 2 + 4 + 4 + 4 + 4;
        match width {
            InodeWidth::U32 => fixed + 4,
            InodeWidth::U64 => fixed + 8,
        }
    }

    /// Encode into a full datagram (header plus body).
    pub fn encode(&self, source_port: u16, width: InodeWidth) -> Vec<u8> {
        let body_len = Self::body_len(width);
        let mut buf = Vec::with_capacity(UDP_HEADER_LEN + body_len);

        // Header
        buf.extend_from_slice(&(body_len as u32).to_le_bytes());
        buf.extend_from_slice(&source_port.to_le_bytes());

        // Body
        let mut command = self.command.to_wire();
        if self.is_reply {
            command |= CMD_REPLY;
        }
        buf.extend_from_slice(&command.to_le_bytes());
        buf.extend_from_slice(&self.requester_pid.to_le_bytes());
        buf.extend_from_slice(&self.open_identity.sec.to_le_bytes());
        buf.extend_from_slice(&self.open_identity.usec.to_le_bytes());
        buf.extend_from_slice(&self.key.device_id.to_le_bytes());
        match width {
            InodeWidth::U32 => {
                buf.extend_from_slice(&(self.key.inode_id as u32).to_le_bytes());
            }
            InodeWidth::U64 => {
                // Low word first
                buf.extend_from_slice(&((self.key.inode_id & 0xFFFF_FFFF) as u32).to_le_bytes());
                buf.extend_from_slice(&((self.key.inode_id >> 32) as u32).to_le_bytes());
            }
        }
        buf
    }

    /// Decode a datagram. Returns the message and the sender's port.
    pub fn decode(buf: &[u8], width: InodeWidth) -> Result<(BreakMessage, u16), WireError> {
        if buf.len() < UDP_HEADER_LEN {
            return Err(WireError::Truncated {
                have: buf.len(),
                need: UDP_HEADER_LEN,
            });
        }
        let total_length = read_u32(buf, 0) as usize;
        let source_port = read_u16(buf, 4);

        let expected = Self::body_len(width);
        if total_length != expected {
            return Err(WireError::BadLength {
                was: total_length,
                should: expected,
            });
        }
        if buf.len() < UDP_HEADER_LEN + expected {
            return Err(WireError::Truncated {
                have: buf.len(),
                need: UDP_HEADER_LEN + expected,
            });
        }

        let body = &buf[UDP_HEADER_LEN..];
        let raw_command = read_u16(body, 0);
        let is_reply = raw_command & CMD_REPLY != 0;
        let command = BreakCommand::from_wire(raw_command & !CMD_REPLY)
            .ok_or(WireError::UnknownCommand(raw_command & !CMD_REPLY))?;

        let requester_pid = read_u32(body, 2);
        let sec = read_u32(body, 6);
        let usec = read_u32(body, 10);
        let device_id = read_u32(body, 14);
        let inode_id = match width {
            InodeWidth::U32 => u64::from(read_u32(body, 18)),
            InodeWidth::U64 => {
                let low = read_u32(body, 18);
                let high = read_u32(body, 22);
                u64::from(low) | (u64::from(high) << 32)
            }
        };

        Ok((
            BreakMessage {
                command,
                is_reply,
                requester_pid,
                open_identity: OpenIdentity::new(sec, usec),
                key: FileKey::new(device_id, inode_id),
            },
            source_port,
        ))
    }

    /// The reply to this request: same message, reply bit set.
    pub fn into_reply(mut self) -> BreakMessage {
        self.is_reply = true;
        self
    }

    /// True if `other` is the reply matching this request: reply bit
    /// set, same requester, same entry identity, same file.
    pub fn matches_reply(&self, other: &BreakMessage) -> bool {
        other.is_reply
            && other.command == self.command
            && other.requester_pid == self.requester_pid
            && other.open_identity == self.open_identity
            && other.key == self.key
    }
}
