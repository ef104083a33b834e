use crate::reactor::Appended;
use crate::reactor::poller::unix::sys_write;
use crate::tls::{TlsError, TlsHandle};

use bytes::Bytes;
use std::io;
use std::os::fd::RawFd;

/// Most buffers one outbound message may encode to.
pub(crate) const ENCODE_BUFFERS_MAX: usize = 8192;

/// The outbound half of a session.
pub trait MessageOut: Send {
    /// Serializes the whole message as scatter/gather buffers.
    ///
    /// Empty buffers are allowed and skipped. More than 8192 buffers fail
    /// the exchange with `EOVERFLOW`.
    fn encode(&mut self) -> io::Result<Vec<Bytes>>;
}

/// The inbound half of a session, fed incrementally as bytes arrive.
pub trait MessageIn: Send {
    /// Consumes `buf`.
    ///
    /// Returns [`Appended::Complete`] with the bytes that belong to this
    /// message once it is whole, [`Appended::Incomplete`] when every byte was
    /// consumed and more are needed. An error aborts the connection.
    fn append(&mut self, buf: &[u8], cx: &mut ReceiveContext<'_>) -> io::Result<Appended>;
}

/// What an inbound message may do to its connection while receiving.
pub struct ReceiveContext<'a> {
    fd: RawFd,
    tls: Option<&'a TlsHandle>,
    renewed: bool,
}

impl<'a> ReceiveContext<'a> {
    pub(crate) fn new(fd: RawFd, tls: Option<&'a TlsHandle>) -> Self {
        Self {
            fd,
            tls,
            renewed: false,
        }
    }

    /// Writes a small reply straight to the peer, without waiting for
    /// writability. Returns how many bytes the socket took.
    pub fn feedback(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.tls {
            None => sys_write(self.fd, buf),
            Some(_) if buf.is_empty() => Ok(0),
            Some(tls) => tls.lock().write(buf).map_err(|e| match e {
                TlsError::Io(e) => e,
                TlsError::Want(_) => io::Error::from(io::ErrorKind::WouldBlock),
            }),
        }
    }

    /// Restarts the receive budget, as if the message had just begun.
    pub fn renew(&mut self) {
        self.renewed = true;
    }

    pub(crate) fn renewed(&self) -> bool {
        self.renewed
    }
}
