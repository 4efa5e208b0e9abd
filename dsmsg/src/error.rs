//! Error taxonomy. See §7 of the wire-format design: transient conditions
//! never reach the caller as an error value; they only ever mean "no
//! progress this call, try later" inside `flush_send`/`flush_recv`.

use std::io;

use crate::frame::HeaderError;

/// The code captured on an endpoint when it transitions to ERRORED, and
/// surfaced via `Endpoint::last_error`. Deliberately not `io::Error`: that
/// type isn't `Eq`/`Clone`, and an endpoint needs to hand its captured code
/// out repeatedly without taking ownership of it, same as
/// `t51core::net::result::Error` storing `io::ErrorKind` rather than
/// `io::Error` for the same reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Errno {
    #[error("transport error: {0:?}")]
    Transport(io::ErrorKind),
    #[error("protocol error: {0}")]
    Protocol(ProtocolErrorKind),
    #[error("peer closed the connection mid-frame")]
    PeerClosed,
    #[error("asynchronous connect failed: {0:?}")]
    Connect(io::ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    BadMagic,
    BadType(u8),
    LengthOutOfRange,
}

impl std::fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolErrorKind::BadMagic => write!(f, "bad magic"),
            ProtocolErrorKind::BadType(t) => write!(f, "unrecognized type {}", t),
            ProtocolErrorKind::LengthOutOfRange => write!(f, "length out of range"),
        }
    }
}

impl From<HeaderError> for Errno {
    fn from(e: HeaderError) -> Errno {
        let kind = match e {
            HeaderError::BadMagic => ProtocolErrorKind::BadMagic,
            HeaderError::BadType(t) => ProtocolErrorKind::BadType(t),
            HeaderError::LengthOutOfRange => ProtocolErrorKind::LengthOutOfRange,
        };
        Errno::Protocol(kind)
    }
}

/// Outcome of a single `flush_send`/`flush_recv` attempt to make progress.
#[derive(Debug)]
pub(crate) enum FlushOutcome {
    /// No more progress possible on this call; caller made it to a stable
    /// point (queue empty, or `recv_ready` populated).
    Done,
    /// A transient condition (would-block, interrupted, in-progress,
    /// already-connected) stopped the loop; not an error.
    Blocked,
    /// A transport or protocol error occurred; the endpoint must die.
    Fatal(Errno),
}

/// Synchronous API-misuse errors from the poll aggregator. Reported
/// immediately; they never change endpoint or aggregator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("endpoint is already a member of this aggregator")]
    AlreadyMember,
    #[error("endpoint already belongs to a different aggregator")]
    AlreadyInAnotherGroup,
    #[error("endpoint is not a member of this aggregator")]
    NotMember,
}

pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
