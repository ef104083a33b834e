//! TLS boundary.
//!
//! weft does not implement TLS itself. A [`TlsContext`] supplied on a target
//! or service wraps each connected descriptor in a [`TlsStream`]; the
//! multiplexer drives the stream's non-blocking handshake, I/O and shutdown
//! and flips the registered readiness whenever the stream asks for it.

use parking_lot::Mutex;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Readiness a TLS operation is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Want {
    Read,
    Write,
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// The operation cannot progress until the descriptor is ready.
    #[error("tls operation wants {0:?}")]
    Want(Want),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A TLS session bound to one non-blocking descriptor.
pub trait TlsStream: Send {
    fn accept(&mut self) -> Result<(), TlsError>;
    fn connect(&mut self) -> Result<(), TlsError>;
    fn shutdown(&mut self) -> Result<(), TlsError>;

    /// Returns `Ok(0)` on a clean close by the peer.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsError>;
    fn write(&mut self, buf: &[u8]) -> Result<usize, TlsError>;
}

/// Factory of [`TlsStream`]s, shared by every connection of a target or service.
pub trait TlsContext: Send + Sync {
    fn new_stream(&self, fd: RawFd) -> io::Result<Box<dyn TlsStream>>;
}

/// TLS settings of a target or service.
#[derive(Clone)]
pub struct TlsConfig {
    pub context: Arc<dyn TlsContext>,

    /// Deadline of the handshake; `None` waits forever.
    pub handshake_timeout: Option<Duration>,
}

/// A stream shared between the multiplexer thread and the session owner.
pub type TlsHandle = Arc<Mutex<Box<dyn TlsStream>>>;
