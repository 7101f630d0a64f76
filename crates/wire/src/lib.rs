//! Datagram wire protocol for peer-to-peer oplock break coordination.
//!
//! Every cooperating process owns a private loopback UDP port; the
//! `break_port` recorded in each share-mode entry lets a requester
//! address the entry's owner directly, with no rendezvous service. The
//! message layout is fixed and little-endian so that process generations
//! that may interoperate always agree on it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod message;
pub mod messenger;

pub use message::{BreakCommand, BreakMessage, WireError, CMD_REPLY, UDP_HEADER_LEN};
pub use messenger::{BreakMessenger, BreakResponder};
