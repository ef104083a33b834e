use super::entry::{
    ConnEntry, ConnState, Context, EntryInner, EntryMessage, first_response_timeout,
    first_timeout_recv, first_timeout_send,
};
use super::message::ENCODE_BUFFERS_MAX;
use super::service::{Binding, CommService, ServiceConfig, ServiceRef};
use super::session::{CommSession, Passive, SessionState};
use super::sleep::{SleepSession, SleepState};
use super::target::CommTarget;
use crate::reactor::poller::unix::{
    IOV_MAX, sys_bind, sys_connect, sys_listen, sys_set_reuseaddr, sys_sockname, sys_socket,
    sys_write, sys_writev,
};
use crate::reactor::{
    MultiPoll, Operation, Payload, PollData, PollHandler, PollMessage, PollResult, ResultState,
    advance,
};
use crate::runtime::{MsgQueue, ThreadPool};
use crate::tls::TlsError;
use crate::{Error, Result};

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A session the communicator refused to take, handed back with the reason.
///
/// A rejected session never receives its `handle` call; the caller owns it
/// again.
pub struct Rejected<S: ?Sized = dyn CommSession> {
    pub error: Error,
    pub session: Box<S>,
}

impl<S: ?Sized> fmt::Debug for Rejected<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<S: ?Sized> fmt::Display for Rejected<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session rejected: {}", self.error)
    }
}

/// Outcome of a synchronous send attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Sent {
    /// Every byte went out.
    Done,
    /// The rest is queued on a write node.
    Pending,
}

/// Connection engine for request/response protocols.
///
/// The communicator owns a set of multiplexer threads and a pool of handler
/// threads. Multiplexer threads only move bytes and forward every outcome
/// through a message queue; handler threads run the connection state
/// machine and every session callback.
///
/// Client connections are pooled per [`CommTarget`]: after a complete
/// response whose session allows keep-alive, the connection parks on the
/// target's idle list and the next [`request`](Self::request) reuses it.
/// Server connections accepted by a [`bind`](Self::bind) listener are parked
/// on the service's keep-alive list between requests.
///
/// Dropping the communicator stops it, after which every session still in
/// flight is reported `Stopped`.
pub struct Communicator {
    inner: Arc<CommInner>,
}

struct CommInner {
    poll: MultiPoll<Context>,
    queue: Arc<MsgQueue<PollResult<Context>>>,
    pool: ThreadPool,
    stopped: AtomicBool,
}

/// Multiplexer-side hooks: build inbound messages, refresh write deadlines
/// and queue every result for the handler threads.
struct CommHandler {
    queue: Arc<MsgQueue<PollResult<Context>>>,
}

impl PollHandler<Context> for CommHandler {
    fn create_message(&self, context: &Context) -> io::Result<Box<dyn PollMessage>> {
        match context {
            Context::Conn(entry) => create_message(entry),
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    fn partial_written(&self, _written: usize, context: &Context) -> io::Result<()> {
        let Context::Conn(entry) = context else {
            return Ok(());
        };

        let timeout = {
            let mut inner = entry.inner.lock();
            match inner.session.as_deref_mut() {
                Some(session) => session.core_mut().timing.next(entry.response_timeout()),
                None => return Ok(()),
            }
        };

        let _ = entry.poll.set_timeout(entry.fd, timeout);
        Ok(())
    }

    fn callback(&self, result: PollResult<Context>) {
        self.queue.put(result);
    }
}

/// Picks the session the next inbound bytes of `entry` belong to.
fn create_message(entry: &Arc<ConnEntry>) -> io::Result<Box<dyn PollMessage>> {
    if entry.state() == ConnState::Idle && entry.service.is_some() {
        // A reply may be in flight under the target lock; wait it out.
        drop(entry.target.idle.lock());
    }

    let mut inner = entry.inner.lock();
    match entry.state() {
        ConnState::Connected | ConnState::KeepAlive => create_service_session(entry, &mut inner)?,
        ConnState::Receiving => {}
        _ => return Err(io::Error::from_raw_os_error(libc::EBADMSG)),
    }

    Ok(Box::new(EntryMessage {
        entry: entry.clone(),
    }))
}

fn create_service_session(entry: &Arc<ConnEntry>, inner: &mut EntryInner) -> io::Result<()> {
    let Some(svc) = &entry.service else {
        return Err(io::Error::from_raw_os_error(libc::EBADMSG));
    };

    {
        let mut alive = svc.alive.lock();
        match entry.state() {
            ConnState::KeepAlive => remove_entry(&mut alive.entries, entry),
            ConnState::Connected => {}
            _ => return Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    let seq = entry.next_seq();
    let mut session = svc
        .service
        .new_session(seq, &entry.conn)
        .ok_or_else(|| io::Error::from_raw_os_error(libc::ECANCELED))?;

    let core = session.core_mut();
    core.target = Some(entry.target.clone());
    core.conn = Some(entry.conn.clone());
    core.seq = seq;
    core.passive = Passive::ToReply;

    let timeout = first_timeout_recv(session.as_mut(), entry.response_timeout());
    let _ = entry.poll.set_timeout(entry.fd, timeout);

    entry.set_state(ConnState::Receiving);
    inner.session = Some(session);
    Ok(())
}

fn remove_entry(list: &mut VecDeque<Arc<ConnEntry>>, entry: &Arc<ConnEntry>) {
    if let Some(pos) = list.iter().position(|e| Arc::ptr_eq(e, entry)) {
        list.remove(pos);
    }
}

/// Writes as much of `buffers` as the socket takes without blocking.
fn write_sync(entry: &ConnEntry, buffers: &mut VecDeque<Bytes>) -> io::Result<()> {
    while let Some(front) = buffers.front() {
        let written = match entry.tls() {
            Some(tls) => match tls.lock().write(front) {
                Ok(n) => n,
                Err(TlsError::Want(_)) => return Ok(()),
                Err(TlsError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(TlsError::Io(e)) => return Err(e),
            },
            None => {
                let slices: Vec<IoSlice<'_>> = buffers
                    .iter()
                    .take(IOV_MAX)
                    .map(|b| IoSlice::new(b))
                    .collect();

                match sys_writev(entry.fd, &slices) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        };

        advance(buffers, written);
    }

    Ok(())
}

impl Communicator {
    /// Starts `poller_threads` multiplexer loops and `handler_threads`
    /// handler threads.
    ///
    /// # Arguments
    ///
    /// * `poller_threads` - Number of multiplexer loops, at least one.
    /// * `handler_threads` - Number of threads running session callbacks.
    /// * `max_open_files` - Size of each loop's descriptor table.
    ///
    /// # Errors
    ///
    /// Returns an error if `poller_threads` is zero or a loop or thread
    /// cannot be started.
    pub fn new(poller_threads: usize, handler_threads: usize, max_open_files: usize) -> Result<Self> {
        if poller_threads == 0 {
            return Err(Error::from_errno(libc::EINVAL));
        }

        let queue = Arc::new(MsgQueue::new());
        let handler = Arc::new(CommHandler {
            queue: queue.clone(),
        });

        let poll = MultiPoll::new(poller_threads, max_open_files, handler)?;
        poll.start()?;

        let pool = match ThreadPool::new("weft-handler", handler_threads) {
            Ok(pool) => pool,
            Err(e) => {
                poll.stop();
                return Err(e);
            }
        };

        let inner = Arc::new(CommInner {
            poll,
            queue,
            pool,
            stopped: AtomicBool::new(false),
        });

        for _ in 0..handler_threads {
            spawn_routine(&inner);
        }

        debug!(poller_threads, handler_threads, "communicator started");
        Ok(Self { inner })
    }

    /// Sends `session`'s request to `target`, reusing an idle connection
    /// when one is pooled.
    ///
    /// On success the session receives exactly one `handle` call later.
    ///
    /// # Errors
    ///
    /// Returns the session back when it is a server session, or when no
    /// connection could be started.
    pub fn request(
        &self,
        mut session: Box<dyn CommSession>,
        target: &Arc<CommTarget>,
    ) -> std::result::Result<(), Rejected> {
        if session.core().passive != Passive::Client {
            return Err(Rejected {
                error: Error::InvalidState("server sessions cannot issue requests"),
                session,
            });
        }

        session.core_mut().target = Some(target.clone());

        match self.inner.request_idle_conn(session, target) {
            Ok(()) => Ok(()),
            Err(session) => self.inner.request_new_conn(session, target),
        }
    }

    /// Sends the reply of a server session that reached `ToReply`.
    ///
    /// # Errors
    ///
    /// Returns the session back if it is not waiting for a reply or its
    /// connection went away in the meantime.
    pub fn reply(&self, session: Box<dyn CommSession>) -> std::result::Result<(), Rejected> {
        self.inner.reply(session)
    }

    /// Writes `buf` straight to the connection of a server session waiting
    /// for its reply, bypassing the message machinery.
    ///
    /// Returns the number of bytes written, which may be short.
    pub fn push(&self, buf: &[u8], session: &dyn CommSession) -> Result<usize> {
        let core = session.core();
        if core.passive != Passive::ToReply {
            return Err(Error::InvalidState("only sessions waiting for a reply can push"));
        }

        let Some(target) = core.target() else {
            return Err(Error::ConnectionGone);
        };

        let idle = target.idle.lock();
        let entry = idle.front().ok_or(Error::ConnectionGone)?;

        match entry.tls() {
            None => Ok(sys_write(entry.fd, buf)?),
            Some(_) if buf.is_empty() => Ok(0),
            Some(tls) => match tls.lock().write(buf) {
                Ok(n) => Ok(n),
                Err(TlsError::Want(_)) => Err(Error::WouldBlock),
                Err(TlsError::Io(e)) => Err(e.into()),
            },
        }
    }

    /// Opens a listener and starts accepting connections for `service`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or registered.
    pub fn bind(&self, config: ServiceConfig, service: Arc<dyn CommService>) -> Result<Binding> {
        self.inner.bind(config, service)
    }

    /// Stops the listener of `binding`.
    ///
    /// Keep-alive connections are closed; requests in flight finish. The
    /// service's `handle_unbound` runs once the last of them is gone.
    pub fn unbind(&self, binding: Binding) {
        let svc = &binding.service;
        if !self.inner.poll.delete(svc.listen_fd()) {
            svc.shutdown();
        }

        debug!(addr = %svc.local_addr(), "service unbound");
    }

    /// Starts a pure timer that calls `session.handle` after its duration.
    ///
    /// # Errors
    ///
    /// Returns the session back if the timer cannot be registered.
    pub fn sleep(
        &self,
        session: Box<dyn SleepSession>,
    ) -> std::result::Result<(), Rejected<dyn SleepSession>> {
        let duration = session.duration();
        let cell = Arc::new(Mutex::new(Some(session)));

        match self.inner.poll.add_timer(duration, Context::Sleep(cell.clone())) {
            Ok(()) => Ok(()),
            Err(error) => match cell.lock().take() {
                Some(session) => Err(Rejected { error, session }),
                None => Ok(()),
            },
        }
    }

    /// Adds one handler thread.
    pub fn increase_handler_thread(&self) -> Result<()> {
        self.inner.pool.increase()?;
        spawn_routine(&self.inner);
        Ok(())
    }

    /// Whether the calling thread is one of this communicator's handlers.
    pub fn is_handler_thread(&self) -> bool {
        self.inner.pool.in_pool()
    }

    /// Number of multiplexer loops.
    pub fn poller_threads(&self) -> usize {
        self.inner.poll.threads()
    }

    /// Stops every loop, reports all live sessions `Stopped` and joins the
    /// handler threads. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("poller_threads", &self.inner.poll.threads())
            .field("handler_threads", &self.inner.pool.threads())
            .field("stopped", &self.inner.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

fn spawn_routine(inner: &Arc<CommInner>) {
    let comm = inner.clone();
    inner.pool.spawn(move || comm.routine());
}

impl CommInner {
    fn routine(&self) {
        while let Some(result) = self.queue.get() {
            self.handle_result(result);
        }

        trace!("handler routine exiting");
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.poll.stop();
        self.queue.set_nonblock();
        self.pool.destroy();

        debug!("communicator stopped");
    }

    fn handle_result(&self, result: PollResult<Context>) {
        let PollResult { state, error, data } = result;
        let PollData {
            operation,
            context,
            payload,
            ..
        } = data;

        trace!(?operation, ?state, error, "poll result");

        match (context, operation) {
            (Context::Conn(entry), Operation::Read) => {
                if state == ResultState::Modified {
                    return;
                }

                if entry.service.is_some() {
                    self.handle_incoming_request(&entry, state, error);
                } else {
                    self.handle_incoming_reply(&entry, state, error);
                }
            }
            (Context::Conn(entry), Operation::Write) => {
                if entry.service.is_some() {
                    self.handle_reply_result(&entry, state, error);
                } else {
                    self.handle_request_result(&entry, state, error);
                }
            }
            (Context::Conn(entry), Operation::Connect | Operation::TlsConnect) => {
                self.handle_connect_result(&entry, state, error);
            }
            (Context::Conn(entry), Operation::TlsAccept) => {
                self.handle_tls_accept_result(&entry, state);
            }
            (Context::Listen(svc), Operation::Listen) => {
                self.handle_listen_result(&svc, state, error, payload);
            }
            (Context::Sleep(cell), Operation::Timer) => {
                let state = match state {
                    ResultState::Stopped => SleepState::Disrupted,
                    _ => SleepState::Complete,
                };

                if let Some(session) = cell.lock().take() {
                    session.handle(state, 0);
                }
            }
            (_, operation) => trace!(?operation, "unhandled poll result"),
        }
    }

    /// Maps a failed read, write or connect result to the session state
    /// and error it is reported with.
    fn failure(state: ResultState, error: i32) -> Option<(SessionState, i32)> {
        match state {
            ResultState::Finished => Some((SessionState::Error, libc::ECONNRESET)),
            ResultState::Error => Some((SessionState::Error, error)),
            ResultState::Deleted | ResultState::Stopped => Some((SessionState::Stopped, error)),
            ResultState::Success | ResultState::Modified => None,
        }
    }

    fn take_session(entry: &ConnEntry) -> Option<Box<dyn CommSession>> {
        entry.inner.lock().session.take()
    }

    fn handle_incoming_reply(&self, entry: &Arc<ConnEntry>, state: ResultState, error: i32) {
        let (state, error, session) = if state == ResultState::Success {
            let mut idle = entry.target.idle.lock();
            let session = Self::take_session(entry);

            if entry.state() == ConnState::Success {
                let keep_alive = session.as_ref().is_some_and(|s| s.core().timing.keep_alive);
                if keep_alive {
                    entry.set_state(ConnState::Idle);
                    idle.push_front(entry.clone());
                } else {
                    entry.set_state(ConnState::Closing);
                }
            }

            (SessionState::Success, 0, session)
        } else {
            let Some((mut state, mut error)) = Self::failure(state, error) else {
                return;
            };

            let mut idle = entry.target.idle.lock();
            let mut inner = entry.inner.lock();

            let session = match entry.state() {
                ConnState::Idle => {
                    remove_entry(&mut idle, entry);
                    None
                }
                ConnState::Error => {
                    state = SessionState::Error;
                    error = entry.error();
                    inner.session.take()
                }
                ConnState::Receiving => inner.session.take(),
                ConnState::Success => {
                    entry.set_state(ConnState::Closing);
                    None
                }
                _ => None,
            };

            (state, error, session)
        };

        if let Some(session) = session {
            entry.target.release(entry.state() == ConnState::Idle);
            trace!(fd = entry.fd, ?state, error, "response handled");
            session.handle(state, error);
        }
    }

    fn handle_incoming_request(&self, entry: &Arc<ConnEntry>, state: ResultState, error: i32) {
        if state == ResultState::Success {
            let session = {
                let mut idle = entry.target.idle.lock();
                let session = Self::take_session(entry);

                if entry.state() == ConnState::Success {
                    entry.set_state(ConnState::Idle);
                    idle.push_front(entry.clone());
                }

                session
            };

            if let Some(session) = session {
                session.handle(SessionState::ToReply, 0);
            }
            return;
        }

        let Some((mut state, mut error)) = Self::failure(state, error) else {
            return;
        };

        let session = {
            let mut idle = entry.target.idle.lock();
            let mut inner = entry.inner.lock();

            match entry.state() {
                ConnState::KeepAlive => {
                    if let Some(svc) = &entry.service {
                        let mut alive = svc.alive.lock();
                        if entry.state() == ConnState::KeepAlive {
                            remove_entry(&mut alive.entries, entry);
                        }
                    }
                    None
                }
                ConnState::Idle => {
                    remove_entry(&mut idle, entry);
                    None
                }
                ConnState::Error => {
                    state = SessionState::Error;
                    error = entry.error();
                    inner.session.take()
                }
                ConnState::Receiving => inner.session.take(),
                ConnState::Success => {
                    entry.set_state(ConnState::Closing);
                    None
                }
                _ => None,
            }
        };

        if let Some(session) = session {
            session.handle(state, error);
        }
    }

    /// A client request finished writing: wait for the response.
    fn handle_request_result(&self, entry: &Arc<ConnEntry>, state: ResultState, error: i32) {
        let (state, error) = match state {
            ResultState::Finished => {
                entry.set_state(ConnState::Receiving);

                let added = {
                    let mut inner = entry.inner.lock();
                    let timeout = inner
                        .session
                        .as_deref_mut()
                        .and_then(|s| first_response_timeout(s, entry.response_timeout()));
                    self.poll.add(entry.poll_data(Operation::Read), timeout)
                };

                match added {
                    Ok(()) => return,
                    Err(e) => (SessionState::Error, e.errno()),
                }
            }
            ResultState::Error => (SessionState::Error, error),
            ResultState::Deleted | ResultState::Stopped => (SessionState::Stopped, error),
            _ => return,
        };

        entry.target.release(false);
        if let Some(session) = Self::take_session(entry) {
            session.handle(state, error);
        }
    }

    /// A server reply finished writing: park the connection for keep-alive
    /// and finish the session.
    fn handle_reply_result(&self, entry: &Arc<ConnEntry>, state: ResultState, error: i32) {
        let state = match state {
            ResultState::Finished => {
                let keep_alive = entry
                    .inner
                    .lock()
                    .session
                    .as_ref()
                    .map_or(Some(Duration::ZERO), |s| s.keep_alive_timeout());

                if keep_alive != Some(Duration::ZERO) {
                    self.keep_alive(entry, keep_alive);
                }
                SessionState::Success
            }
            ResultState::Error => SessionState::Error,
            ResultState::Deleted | ResultState::Stopped => SessionState::Stopped,
            _ => return,
        };

        if let Some(session) = Self::take_session(entry) {
            session.handle(state, error);
        }
    }

    fn keep_alive(&self, entry: &Arc<ConnEntry>, timeout: Option<Duration>) {
        let Some(svc) = &entry.service else {
            return;
        };

        let _idle = entry.target.idle.lock();
        if self.poll.add(entry.poll_data(Operation::Read), timeout).is_err() {
            return;
        }

        let mut alive = svc.alive.lock();
        if alive.listening && !self.is_stopped() {
            entry.set_state(ConnState::KeepAlive);
            alive.entries.push_back(entry.clone());
        } else {
            drop(alive);
            self.poll.delete(entry.fd);
            entry.set_state(ConnState::Closing);
        }
    }

    fn handle_connect_result(&self, entry: &Arc<ConnEntry>, state: ResultState, error: i32) {
        let (state, error) = match state {
            ResultState::Finished => match self.after_connect(entry) {
                Ok(()) => return,
                Err(e) => (SessionState::Error, e.errno()),
            },
            ResultState::Error => (SessionState::Error, error),
            ResultState::Deleted | ResultState::Stopped => (SessionState::Stopped, error),
            _ => return,
        };

        debug!(addr = %entry.target.addr(), ?state, error, "connect failed");

        entry.target.release(false);
        if let Some(session) = Self::take_session(entry) {
            session.handle(state, error);
        }
    }

    /// Runs the TLS handshake if the target wants one, then sends the
    /// pending request.
    fn after_connect(&self, entry: &Arc<ConnEntry>) -> Result<()> {
        if let Some(tls) = entry.target.tls() {
            if entry.tls().is_none() {
                let stream = tls.context.new_stream(entry.fd)?;
                entry.set_tls(Arc::new(Mutex::new(stream)));

                return self
                    .poll
                    .add(entry.poll_data(Operation::TlsConnect), tls.handshake_timeout);
            }
        }

        let mut inner = entry.inner.lock();
        match self.send_message(entry, &mut inner)? {
            Sent::Done => {
                let timeout = inner
                    .session
                    .as_deref_mut()
                    .and_then(|s| first_response_timeout(s, entry.response_timeout()));
                self.poll.add(entry.poll_data(Operation::Read), timeout)
            }
            Sent::Pending => Ok(()),
        }
    }

    fn handle_tls_accept_result(&self, entry: &Arc<ConnEntry>, state: ResultState) {
        if state == ResultState::Finished
            && self
                .poll
                .add(entry.poll_data(Operation::Read), entry.response_timeout())
                .is_ok()
        {
            return;
        }

        trace!(fd = entry.fd, ?state, "tls accept dropped");
    }

    fn handle_listen_result(
        &self,
        svc: &Arc<ServiceRef>,
        state: ResultState,
        error: i32,
        payload: Payload,
    ) {
        match state {
            ResultState::Success => {
                if let Payload::Accepted { fd, addr } = payload {
                    if let Err(e) = self.accept_conn(svc, fd, addr) {
                        warn!(peer = %addr, error = %e, "failed to accept connection");
                    }
                }
            }
            ResultState::Deleted => svc.shutdown(),
            ResultState::Error | ResultState::Stopped => {
                debug!(addr = %svc.local_addr(), ?state, error, "listener stopped");
                svc.service.handle_stop(error);
            }
            ResultState::Finished | ResultState::Modified => {}
        }
    }

    fn accept_conn(&self, svc: &Arc<ServiceRef>, socket: OwnedFd, peer: SocketAddr) -> Result<()> {
        let target = Arc::new(CommTarget::for_peer(
            peer,
            svc.config.response_timeout,
            svc.clone(),
        ));

        let entry = Arc::new(ConnEntry::new(
            socket,
            target,
            Some(svc.clone()),
            ConnState::Connected,
            self.poll.clone(),
        ));

        trace!(%peer, fd = entry.fd, "connection accepted");

        match &svc.config.tls {
            Some(tls) => {
                let stream = tls.context.new_stream(entry.fd)?;
                entry.set_tls(Arc::new(Mutex::new(stream)));
                self.poll
                    .add(entry.poll_data(Operation::TlsAccept), tls.handshake_timeout)
            }
            None => self
                .poll
                .add(entry.poll_data(Operation::Read), entry.response_timeout()),
        }
    }

    /// Encodes the entry's session and writes it, falling back to a write
    /// node for whatever the socket does not take right away.
    fn send_message(&self, entry: &Arc<ConnEntry>, inner: &mut EntryInner) -> Result<Sent> {
        let session = inner
            .session
            .as_deref_mut()
            .ok_or(Error::InvalidState("no session on connection"))?;

        let encoded = session
            .message_out()
            .ok_or_else(|| Error::from_errno(libc::EBADMSG))?
            .encode()?;

        if encoded.len() > ENCODE_BUFFERS_MAX {
            return Err(Error::from_errno(libc::EOVERFLOW));
        }

        let mut buffers: VecDeque<Bytes> = encoded.into_iter().filter(|b| !b.is_empty()).collect();
        write_sync(entry, &mut buffers)?;

        if buffers.is_empty() {
            self.after_sync_send(entry, session);
            return Ok(Sent::Done);
        }

        let timeout = first_timeout_send(session, entry.response_timeout());
        let data = entry.write_data(buffers);

        if entry.state() == ConnState::Idle {
            match self.poll.modify(data, timeout) {
                Ok(()) => Ok(Sent::Pending),
                // The read node resolved under us; its result reports the failure.
                Err(Error::NotRegistered(_)) => {
                    entry.set_state(ConnState::Receiving);
                    Ok(Sent::Pending)
                }
                Err(e) => Err(e),
            }
        } else {
            self.poll.add(data, timeout).map(|()| Sent::Pending)
        }
    }

    fn after_sync_send(&self, entry: &Arc<ConnEntry>, session: &mut dyn CommSession) {
        let Some(svc) = &entry.service else {
            if entry.state() == ConnState::Idle {
                let timeout = first_response_timeout(session, entry.response_timeout());
                let _ = self.poll.set_timeout(entry.fd, timeout);
            }
            entry.set_state(ConnState::Receiving);
            return;
        };

        let keep_alive = session.keep_alive_timeout();
        if keep_alive == Some(Duration::ZERO) {
            self.poll.delete(entry.fd);
            entry.set_state(ConnState::Closing);
            return;
        }

        let _ = self.poll.set_timeout(entry.fd, keep_alive);

        let mut alive = svc.alive.lock();
        if alive.listening && !self.is_stopped() {
            entry.set_state(ConnState::KeepAlive);
            alive.entries.push_back(entry.clone());
        } else {
            drop(alive);
            self.poll.delete(entry.fd);
            entry.set_state(ConnState::Closing);
        }
    }

    fn request_idle_conn(
        &self,
        mut session: Box<dyn CommSession>,
        target: &Arc<CommTarget>,
    ) -> std::result::Result<(), Box<dyn CommSession>> {
        loop {
            let Some(entry) = target.idle.lock().pop_front() else {
                return Err(session);
            };

            let mut inner = entry.inner.lock();
            if self.poll.set_timeout(entry.fd, None).is_err() {
                entry.set_state(ConnState::Closing);
                continue;
            }

            let seq = entry.next_seq();
            session.core_mut().attach(entry.conn.clone(), seq);
            inner.session = Some(session);

            if let Err(e) = self.send_message(&entry, &mut inner) {
                debug!(fd = entry.fd, error = %e, "send on reused connection failed");
                entry.fail(e.errno());
            }

            trace!(fd = entry.fd, seq, "idle connection reused");
            return Ok(());
        }
    }

    fn request_new_conn(
        &self,
        mut session: Box<dyn CommSession>,
        target: &Arc<CommTarget>,
    ) -> std::result::Result<(), Rejected> {
        let socket = match Self::connect(target.addr()) {
            Ok(socket) => socket,
            Err(error) => {
                session.core_mut().detach();
                return Err(Rejected { error, session });
            }
        };

        let entry = Arc::new(ConnEntry::new(
            socket,
            target.clone(),
            None,
            ConnState::Connecting,
            self.poll.clone(),
        ));

        let seq = entry.next_seq();
        session.core_mut().attach(entry.conn.clone(), seq);

        let mut inner = entry.inner.lock();
        if let Err(error) = self
            .poll
            .add(entry.poll_data(Operation::Connect), target.connect_timeout())
        {
            drop(inner);
            session.core_mut().detach();
            return Err(Rejected { error, session });
        }

        inner.session = Some(session);
        trace!(addr = %target.addr(), fd = entry.fd, "connecting");
        Ok(())
    }

    fn connect(addr: SocketAddr) -> Result<OwnedFd> {
        let fd = sys_socket(&addr)?;

        // SAFETY: `fd` was just created and is owned by nothing else.
        let socket = unsafe { OwnedFd::from_raw_fd(fd) };
        sys_connect(socket.as_raw_fd(), &addr)?;

        Ok(socket)
    }

    fn reply(&self, mut session: Box<dyn CommSession>) -> std::result::Result<(), Rejected> {
        match session.core().passive {
            Passive::ToReply => {}
            Passive::Replied => {
                return Err(Rejected {
                    error: Error::InvalidState("session already replied"),
                    session,
                });
            }
            Passive::Client => {
                return Err(Rejected {
                    error: Error::InvalidState("client sessions cannot reply"),
                    session,
                });
            }
        }

        session.core_mut().passive = Passive::Replied;

        let Some(target) = session.core().target.clone() else {
            return Err(Rejected {
                error: Error::ConnectionGone,
                session,
            });
        };

        let done = {
            let mut idle = target.idle.lock();
            let Some(entry) = idle.pop_front() else {
                drop(idle);
                return Err(Rejected {
                    error: Error::ConnectionGone,
                    session,
                });
            };

            let mut inner = entry.inner.lock();
            inner.session = Some(session);

            match self.send_message(&entry, &mut inner) {
                Ok(Sent::Done) => inner.session.take(),
                Ok(Sent::Pending) => None,
                Err(e) => {
                    debug!(fd = entry.fd, error = %e, "reply failed");
                    entry.fail(e.errno());
                    None
                }
            }
        };

        if let Some(session) = done {
            session.handle(SessionState::Success, 0);
        }

        Ok(())
    }

    fn bind(&self, config: ServiceConfig, service: Arc<dyn CommService>) -> Result<Binding> {
        let addr = config.bind_addr;
        let fd = sys_socket(&addr)?;

        // SAFETY: `fd` was just created and is owned by nothing else.
        let socket = unsafe { OwnedFd::from_raw_fd(fd) };
        sys_set_reuseaddr(fd)?;
        sys_bind(fd, &addr)?;
        sys_listen(fd, libc::SOMAXCONN)?;

        let local_addr = sys_sockname(fd)?;
        let listen_timeout = config.listen_timeout;
        let svc = Arc::new(ServiceRef::new(service, config, socket, local_addr));

        self.poll.add(
            PollData::new(Operation::Listen, fd, Context::Listen(svc.clone())),
            listen_timeout,
        )?;
        svc.mark_bound();

        debug!(addr = %local_addr, "service bound");
        Ok(Binding { service: svc })
    }
}
