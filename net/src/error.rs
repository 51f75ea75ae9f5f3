//! Error types for the reactor core.

use std::io;
use std::os::unix::io::RawFd;

/// Errors surfaced by the reactor core.
///
/// Transient would-block conditions are not errors; they are reported as
/// `io::ErrorKind::WouldBlock` by the socket helpers and handled inline.
/// Invariant violations (two loops on one thread, a poll transition from a
/// foreign thread) are programming bugs and panic instead.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Unrecoverable I/O failure on a descriptor or the readiness facility.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// MOD or DEL was issued for a descriptor the poller does not know.
    #[error("descriptor {0} is not registered with the poller")]
    UnknownDescriptor(RawFd),

    /// A configuration call arrived after `start()`.
    #[error("{0} has already been started")]
    AlreadyStarted(&'static str),

    /// The event loop that owns this object has been torn down.
    #[error("owning event loop is gone")]
    LoopGone,

    /// An operation requires an established connection.
    #[error("connection is not established")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, NetError>;

impl NetError {
    /// True for conditions the caller may retry on the next readiness fire.
    pub fn is_transient(&self) -> bool {
        match self {
            NetError::Io(e) => {
                e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted
            }
            _ => false,
        }
    }
}
