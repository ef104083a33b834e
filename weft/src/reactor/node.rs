use super::poller::Interest;
use crate::tls::TlsHandle;

use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{OwnedFd, RawFd};

/// What a registration does when its descriptor becomes ready.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Drain the socket into incremental inbound messages.
    Read,
    /// Drain a scatter/gather buffer into the socket.
    Write,
    /// Accept connections until the backlog is empty.
    Listen,
    /// Wait for a non-blocking connect to complete.
    Connect,
    TlsAccept,
    TlsConnect,
    TlsShutdown,
    /// Drain an `eventfd` counter.
    Event,
    /// Drain 8-byte values from a pipe.
    Notify,
    /// Pure deadline, no descriptor.
    Timer,
}

impl Operation {
    pub(crate) fn interest(self) -> Option<Interest> {
        match self {
            Operation::Read | Operation::TlsAccept | Operation::Event | Operation::Notify => {
                Some(Interest::READ)
            }
            Operation::Write
            | Operation::Connect
            | Operation::TlsConnect
            | Operation::TlsShutdown => Some(Interest::WRITE),
            Operation::Listen => Some(Interest::ACCEPT),
            Operation::Timer => None,
        }
    }
}

/// Progress of an incremental inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Appended {
    /// Every byte was consumed and more are needed.
    Incomplete,
    /// The message is complete after consuming this many bytes; the rest
    /// belongs to the next message.
    Complete(usize),
}

/// An inbound message being assembled on the multiplexer thread.
pub trait PollMessage: Send {
    fn append(&mut self, buf: &[u8]) -> io::Result<Appended>;
}

/// Operation-specific state carried by a node and its results.
pub enum Payload {
    None,
    /// Current inbound message of a read node, created lazily.
    Message(Option<Box<dyn PollMessage>>),
    /// Bytes still to be written.
    Write(VecDeque<Bytes>),
    /// A connection accepted by a listen node.
    Accepted { fd: OwnedFd, addr: SocketAddr },
    /// A counter or notify value.
    Value(u64),
}

/// Everything a caller hands to the multiplexer for one registration.
pub struct PollData<C> {
    pub operation: Operation,
    pub fd: RawFd,
    pub tls: Option<TlsHandle>,
    pub context: C,
    pub payload: Payload,
}

impl<C> PollData<C> {
    pub fn new(operation: Operation, fd: RawFd, context: C) -> Self {
        let payload = match operation {
            Operation::Read => Payload::Message(None),
            _ => Payload::None,
        };

        Self {
            operation,
            fd,
            tls: None,
            context,
            payload,
        }
    }

    /// A write registration; empty buffers are dropped up front.
    pub fn write(fd: RawFd, buffers: impl IntoIterator<Item = Bytes>, context: C) -> Self {
        let buffers = buffers.into_iter().filter(|b| !b.is_empty()).collect();

        Self {
            operation: Operation::Write,
            fd,
            tls: None,
            context,
            payload: Payload::Write(buffers),
        }
    }

    pub fn timer(context: C) -> Self {
        Self::new(Operation::Timer, -1, context)
    }

    pub fn with_tls(mut self, tls: Option<TlsHandle>) -> Self {
        self.tls = tls;
        self
    }
}

/// How a registration ended, or what one readiness round produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultState {
    /// One unit of output: a complete message, an accepted connection, a value.
    Success,
    /// The operation completed and the node is gone.
    Finished,
    /// The node failed; `error` holds the errno, `ETIMEDOUT` on deadline.
    Error,
    /// Removed by `delete`.
    Deleted,
    /// Replaced by `modify`.
    Modified,
    /// The multiplexer stopped while the node was live.
    Stopped,
}

pub struct PollResult<C> {
    pub state: ResultState,
    pub error: i32,
    pub data: PollData<C>,
}

/// Hooks the multiplexer calls on its loop thread.
///
/// None of them is called with the multiplexer's table lock held, so they
/// may call back into the multiplexer.
pub trait PollHandler<C>: Send + Sync + 'static {
    /// Creates the message the next inbound bytes of a read node feed.
    fn create_message(&self, context: &C) -> io::Result<Box<dyn PollMessage>>;

    /// Reports progress of a write node that hit `EAGAIN`. An error aborts
    /// the node.
    fn partial_written(&self, written: usize, context: &C) -> io::Result<()> {
        let _ = (written, context);
        Ok(())
    }

    /// Receives every result; must not block.
    fn callback(&self, result: PollResult<C>);
}
