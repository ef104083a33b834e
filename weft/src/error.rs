//! Crate-wide error type.
//!
//! Every fallible operation in weft returns [`Error`]. Sessions and tasks
//! carry plain errno-style codes instead, so each variant maps back to one
//! through [`Error::errno`].

use std::io;
use std::os::fd::RawFd;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No free slot and the caller asked not to wait.
    #[error("no free slot available")]
    WouldBlock,

    /// A bounded wait expired.
    #[error("operation timed out")]
    TimedOut,

    #[error("descriptor {0} is not registered")]
    NotRegistered(RawFd),

    #[error("descriptor {0} is already registered")]
    AlreadyRegistered(RawFd),

    #[error("descriptor {0} is out of range")]
    BadDescriptor(RawFd),

    #[error("target already belongs to this group")]
    AlreadyInGroup,

    #[error("target belongs to another group")]
    InOtherGroup,

    #[error("target has pending waiters")]
    Busy,

    #[error("target is not a member of this group")]
    NotInGroup,

    #[error("series already belongs to a parallel work")]
    AlreadyInParallel,

    /// The session is not in a state that allows the call.
    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    /// No idle connection was left to reply on.
    #[error("connection is gone")]
    ConnectionGone,

    #[error("the poller is stopped")]
    Stopped,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Builds an I/O error from a raw errno value.
    pub fn from_errno(errno: i32) -> Self {
        Error::Io(io::Error::from_raw_os_error(errno))
    }

    /// Builds an I/O error from the calling thread's last OS error.
    pub(crate) fn last_os_error() -> Self {
        Error::Io(io::Error::last_os_error())
    }

    /// The errno-style code reported on sessions for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::WouldBlock => libc::EAGAIN,
            Error::TimedOut => libc::ETIMEDOUT,
            Error::NotRegistered(_) => libc::ENOENT,
            Error::AlreadyRegistered(_) => libc::EEXIST,
            Error::BadDescriptor(_) => libc::EBADF,
            Error::AlreadyInGroup => libc::EEXIST,
            Error::InOtherGroup => libc::EINVAL,
            Error::Busy => libc::EBUSY,
            Error::NotInGroup => libc::ENOENT,
            Error::AlreadyInParallel => libc::EINVAL,
            Error::InvalidState(_) => libc::EPERM,
            Error::ConnectionGone => libc::ENOENT,
            Error::Stopped => libc::ESHUTDOWN,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Extracts the errno of an I/O error, defaulting to `EIO`.
pub(crate) fn io_errno(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}
