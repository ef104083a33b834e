use super::connection::Connection;
use super::message::ReceiveContext;
use super::service::ServiceRef;
use super::session::CommSession;
use super::sleep::SleepCell;
use super::target::CommTarget;
use crate::reactor::{Appended, MultiPoll, Operation, PollData, PollMessage};
use crate::tls::TlsHandle;

use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Lifecycle of one pooled connection.
///
/// ```text
/// Connecting -> Connected -> Receiving -> Success -> Idle | KeepAlive
///                                ^                        |
///                                +------------------------+
/// ```
///
/// Any state may fall to `Error` or `Closing`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ConnState {
    Connecting,
    Connected,
    Receiving,
    Success,
    Idle,
    KeepAlive,
    Closing,
    Error,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Receiving,
            3 => ConnState::Success,
            4 => ConnState::Idle,
            5 => ConnState::KeepAlive,
            6 => ConnState::Closing,
            _ => ConnState::Error,
        }
    }
}

/// Poll context of every node the communicator registers.
#[derive(Clone)]
pub(crate) enum Context {
    Conn(Arc<ConnEntry>),
    Listen(Arc<ServiceRef>),
    Sleep(Arc<SleepCell>),
}

pub(crate) struct EntryInner {
    /// The session currently running on the connection.
    pub(crate) session: Option<Box<dyn CommSession>>,
}

/// One socket plus its protocol state.
///
/// Shared by the multiplexer node watching it, the idle or alive list it
/// sits on, and handler threads; the socket closes when the last holder
/// lets go.
pub(crate) struct ConnEntry {
    _socket: OwnedFd,
    pub(crate) fd: RawFd,
    pub(crate) conn: Arc<Connection>,
    pub(crate) target: Arc<CommTarget>,
    pub(crate) service: Option<Arc<ServiceRef>>,
    state: AtomicU8,
    error: AtomicI32,
    seq: AtomicU64,
    tls: OnceLock<TlsHandle>,
    pub(crate) inner: Mutex<EntryInner>,
    pub(crate) poll: MultiPoll<Context>,
}

impl ConnEntry {
    pub(crate) fn new(
        socket: OwnedFd,
        target: Arc<CommTarget>,
        service: Option<Arc<ServiceRef>>,
        state: ConnState,
        poll: MultiPoll<Context>,
    ) -> Self {
        Self {
            fd: socket.as_raw_fd(),
            _socket: socket,
            conn: Arc::new(Connection::new(target.addr())),
            target,
            service,
            state: AtomicU8::new(state as u8),
            error: AtomicI32::new(0),
            seq: AtomicU64::new(0),
            tls: OnceLock::new(),
            inner: Mutex::new(EntryInner { session: None }),
            poll,
        }
    }

    pub(crate) fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn error(&self) -> i32 {
        self.error.load(Ordering::Acquire)
    }

    /// Marks the entry failed; its read node resolution reports `error`.
    pub(crate) fn fail(&self, error: i32) {
        self.error.store(error, Ordering::Release);
        self.poll.delete(self.fd);
        self.set_state(ConnState::Error);
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn tls(&self) -> Option<&TlsHandle> {
        self.tls.get()
    }

    pub(crate) fn set_tls(&self, tls: TlsHandle) {
        let _ = self.tls.set(tls);
    }

    pub(crate) fn poll_data(self: &Arc<Self>, operation: Operation) -> PollData<Context> {
        PollData::new(operation, self.fd, Context::Conn(self.clone())).with_tls(self.tls().cloned())
    }

    pub(crate) fn write_data(
        self: &Arc<Self>,
        buffers: impl IntoIterator<Item = Bytes>,
    ) -> PollData<Context> {
        PollData::write(self.fd, buffers, Context::Conn(self.clone())).with_tls(self.tls().cloned())
    }

    pub(crate) fn response_timeout(&self) -> Option<Duration> {
        self.target.response_timeout()
    }
}

/// Deadline of the first receive step, from the session's receive timeout.
pub(crate) fn first_timeout_recv(session: &mut dyn CommSession, response: Option<Duration>) -> Option<Duration> {
    let budget = session.receive_timeout();
    session.core_mut().timing.first(budget, response)
}

/// Deadline of the first send step, from the session's send timeout.
pub(crate) fn first_timeout_send(session: &mut dyn CommSession, response: Option<Duration>) -> Option<Duration> {
    let budget = session.send_timeout();
    session.core_mut().timing.first(budget, response)
}

/// Deadline while waiting for the first response byte of a client exchange.
pub(crate) fn first_response_timeout(
    session: &mut dyn CommSession,
    response: Option<Duration>,
) -> Option<Duration> {
    match session.first_timeout() {
        Some(first) if first.is_zero() => first_timeout_recv(session, response),
        first => {
            session.core_mut().timing.renew();
            first
        }
    }
}

/// The inbound message of a read node: forwards bytes to the session
/// running on the entry and refreshes the node's deadline.
pub(crate) struct EntryMessage {
    pub(crate) entry: Arc<ConnEntry>,
}

impl PollMessage for EntryMessage {
    fn append(&mut self, buf: &[u8]) -> io::Result<Appended> {
        let entry = &self.entry;
        let mut inner = entry.inner.lock();
        let session = inner
            .session
            .as_deref_mut()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADMSG))?;

        let mut cx = ReceiveContext::new(entry.fd, entry.tls());
        let appended = session
            .message_in()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADMSG))?
            .append(buf, &mut cx)?;

        if cx.renewed() {
            session.core_mut().timing.renew();
        }

        let response = entry.response_timeout();
        let timeout = match appended {
            Appended::Complete(_) => {
                entry.set_state(ConnState::Success);

                if entry.service.is_some() {
                    None
                } else {
                    let keep_alive = session.keep_alive_timeout();
                    let reusable = keep_alive != Some(Duration::ZERO);
                    session.core_mut().timing.keep_alive = reusable;

                    if !reusable {
                        entry.poll.delete(entry.fd);
                        return Ok(appended);
                    }
                    keep_alive
                }
            }
            Appended::Incomplete if !session.core().timing.is_spent() => {
                if session.core().timing.is_pending() {
                    first_timeout_recv(session, response)
                } else {
                    session.core_mut().timing.next(response)
                }
            }
            Appended::Incomplete => return Ok(appended),
        };

        // The node is live while its own message is being fed.
        let _ = entry.poll.set_timeout(entry.fd, timeout);
        Ok(appended)
    }
}
