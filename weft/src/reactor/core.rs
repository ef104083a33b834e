use super::command::Command;
use super::node::{Appended, Operation, Payload, PollData, PollHandler, PollResult, ResultState};
use super::poller::unix::{IOV_MAX, sys_accept, sys_read, sys_socket_error, sys_writev};
use super::poller::{Interest, Poller, Waker};
use super::timeout::{TimeoutKey, TimeoutQueue};
use crate::error::{Error, Result, io_errno};
use crate::tls::{TlsError, Want};

use bytes::{Buf, Bytes};
use libc::epoll_event;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Size of the loop thread's reusable read buffer.
const BUFFER_SIZE: usize = 256 * 1024;

/// One live registration.
///
/// `removed` only changes under the table lock, which makes removal and
/// result delivery happen exactly once no matter which thread gets there
/// first.
pub(crate) struct Node<C> {
    token: u64,
    fd: RawFd,
    operation: Operation,
    removed: AtomicBool,
    data: Mutex<Option<PollData<C>>>,
}

impl<C> Node<C> {
    fn new(token: u64, data: PollData<C>) -> Self {
        Self {
            token,
            fd: data.fd,
            operation: data.operation,
            removed: AtomicBool::new(false),
            data: Mutex::new(Some(data)),
        }
    }
}

struct Registration<C> {
    node: Arc<Node<C>>,
    interest: Interest,
    timeout: Option<TimeoutKey>,
}

struct State<C> {
    /// Dense descriptor-indexed table, grown on demand.
    table: Vec<Option<Registration<C>>>,
    timeouts: TimeoutQueue<Arc<Node<C>>>,
    generation: u32,
    stopped: bool,
}

impl<C> State<C> {
    fn new() -> Self {
        Self {
            table: Vec::new(),
            timeouts: TimeoutQueue::new(),
            generation: 0,
            stopped: true,
        }
    }

    /// Packs a fresh generation with the descriptor so events of a replaced
    /// registration can be told apart from the current one.
    fn next_token(&mut self, fd: RawFd) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        ((self.generation as u64) << 32) | (fd as u32 as u64)
    }

    fn get(&self, fd: RawFd) -> Option<&Registration<C>> {
        self.table.get(fd as usize).and_then(Option::as_ref)
    }

    fn insert(&mut self, fd: RawFd, registration: Registration<C>) {
        let index = fd as usize;
        if index >= self.table.len() {
            self.table.resize_with(index + 1, || None);
        }
        self.table[index] = Some(registration);
    }

    fn take(&mut self, fd: RawFd) -> Option<Registration<C>> {
        self.table.get_mut(fd as usize).and_then(Option::take)
    }

    fn take_matching(&mut self, fd: RawFd, token: u64) -> Option<Registration<C>> {
        match self.get(fd) {
            Some(reg) if reg.node.token == token => self.take(fd),
            _ => None,
        }
    }
}

struct Shared<C> {
    id: usize,
    state: Mutex<State<C>>,
    poller: Poller,
    waker: Arc<Waker>,
    sender: Sender<Command<C>>,
    handler: Arc<dyn PollHandler<C>>,
    max_open_files: usize,
}

/// One multiplexer: a loop thread blocked in `epoll_wait`, the descriptor
/// table and the timeout bookkeeping it owns.
///
/// Every operation may be called from any thread. Results, including the
/// ones of nodes removed from other threads, are handed to the
/// [`PollHandler`] exactly once.
pub struct Poll<C> {
    shared: Arc<Shared<C>>,
    thread: Mutex<Option<JoinHandle<Receiver<Command<C>>>>>,
    receiver: Mutex<Option<Receiver<Command<C>>>>,
}

impl<C: Clone + Send + 'static> Poll<C> {
    /// Creates a stopped multiplexer.
    ///
    /// # Arguments
    ///
    /// * `id` - Index used to name the loop thread
    /// * `max_open_files` - Descriptors at or above this value are rejected
    /// * `handler` - Receives every result
    pub fn new(
        id: usize,
        max_open_files: usize,
        handler: Arc<dyn PollHandler<C>>,
    ) -> Result<Self> {
        let poller = Poller::new()?;
        let waker = poller.waker();
        let (sender, receiver) = channel();

        let shared = Arc::new(Shared {
            id,
            state: Mutex::new(State::new()),
            poller,
            waker,
            sender,
            handler,
            max_open_files,
        });

        Ok(Self {
            shared,
            thread: Mutex::new(None),
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Spawns the loop thread.
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }

        let receiver = self.receiver.lock().take().ok_or(Error::Stopped)?;
        self.shared.state.lock().stopped = false;

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("weft-poll-{}", self.shared.id))
            .spawn(move || {
                let mut looper = Looper::new(shared, receiver);
                looper.run();
                looper.receiver
            });

        match handle {
            Ok(handle) => {
                *thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.state.lock().stopped = true;
                Err(e.into())
            }
        }
    }

    /// Joins the loop thread, then resolves every live node as
    /// [`ResultState::Stopped`] and every pending release with its own state.
    pub fn stop(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };

        let _ = self.shared.sender.send(Command::Shutdown);
        self.shared.waker.wake();

        let receiver = match handle.join() {
            Ok(receiver) => Some(receiver),
            Err(_) => {
                error!(poll = self.shared.id, "poll thread panicked");
                None
            }
        };

        let nodes = {
            let mut st = self.shared.state.lock();
            st.stopped = true;

            let mut nodes = Vec::new();
            for slot in st.table.iter_mut() {
                if let Some(reg) = slot.take() {
                    reg.node.removed.store(true, Ordering::Release);
                    let _ = self.shared.poller.deregister(reg.node.fd);
                    nodes.push(reg.node);
                }
            }

            // Every descriptor node left the table above; whatever the
            // queue still holds are timers or stale keys of those nodes.
            for node in st.timeouts.drain() {
                if !node.removed.swap(true, Ordering::AcqRel) {
                    nodes.push(node);
                }
            }

            nodes
        };

        if let Some(receiver) = receiver {
            while let Ok(command) = receiver.try_recv() {
                if let Command::Release { node, state } = command {
                    self.shared.deliver(&node, state, 0);
                }
            }
            *self.receiver.lock() = Some(receiver);
        }

        debug!(poll = self.shared.id, nodes = nodes.len(), "poll stopped");
        for node in nodes {
            self.shared.deliver(&node, ResultState::Stopped, 0);
        }
    }

    /// Registers `data.fd` for `data.operation`, optionally with a deadline.
    pub fn add(&self, data: PollData<C>, timeout: Option<Duration>) -> Result<()> {
        self.shared.add(data, timeout)
    }

    /// Replaces the live registration of `data.fd`; the old node resolves
    /// as [`ResultState::Modified`].
    pub fn modify(&self, data: PollData<C>, timeout: Option<Duration>) -> Result<()> {
        self.shared.modify(data, timeout)
    }

    /// Removes the live registration of `fd`; it resolves as
    /// [`ResultState::Deleted`]. Returns whether anything was removed.
    pub fn delete(&self, fd: RawFd) -> bool {
        self.shared.delete(fd)
    }

    /// Replaces the deadline of `fd`'s registration; `None` clears it.
    pub fn set_timeout(&self, fd: RawFd, timeout: Option<Duration>) -> Result<()> {
        self.shared.set_timeout(fd, timeout)
    }

    /// Adds a pure timer; it resolves as `Error`/`ETIMEDOUT` when it fires.
    pub fn add_timer(&self, after: Duration, context: C) -> Result<()> {
        self.shared.add_timer(after, context)
    }
}

impl<C> Drop for Poll<C> {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.get_mut().take() {
            let _ = self.shared.sender.send(Command::Shutdown);
            self.shared.waker.wake();
            let _ = handle.join();
        }
    }
}

impl<C: Clone + Send + 'static> Shared<C> {
    fn check_fd(&self, fd: RawFd) -> Result<()> {
        if fd < 0 || fd as usize >= self.max_open_files {
            return Err(Error::BadDescriptor(fd));
        }

        Ok(())
    }

    fn add(&self, data: PollData<C>, timeout: Option<Duration>) -> Result<()> {
        let interest = data
            .operation
            .interest()
            .ok_or_else(|| Error::from_errno(libc::EINVAL))?;
        let fd = data.fd;
        self.check_fd(fd)?;

        let deadline = timeout.map(|t| Instant::now() + t);
        let operation = data.operation;

        let mut st = self.state.lock();
        if st.stopped {
            return Err(Error::Stopped);
        }
        if st.get(fd).is_some() {
            return Err(Error::AlreadyRegistered(fd));
        }

        let token = st.next_token(fd);
        self.poller.register(fd, token, interest)?;

        let node = Arc::new(Node::new(token, data));
        let timeout = deadline.map(|d| st.timeouts.insert(d, node.clone()));
        st.insert(
            fd,
            Registration {
                node,
                interest,
                timeout,
            },
        );

        if let Some(deadline) = deadline {
            self.arm_if_first(&st, deadline);
        }

        trace!(poll = self.id, fd, ?operation, "node added");
        Ok(())
    }

    fn modify(&self, data: PollData<C>, timeout: Option<Duration>) -> Result<()> {
        let interest = data
            .operation
            .interest()
            .ok_or_else(|| Error::from_errno(libc::EINVAL))?;
        let fd = data.fd;
        self.check_fd(fd)?;

        let deadline = timeout.map(|t| Instant::now() + t);

        let (old, stopped) = {
            let mut st = self.state.lock();
            if st.stopped {
                return Err(Error::Stopped);
            }

            let old = st.take(fd).ok_or(Error::NotRegistered(fd))?;
            let token = st.next_token(fd);

            if let Err(e) = self.poller.reregister(fd, token, interest) {
                st.insert(fd, old);
                return Err(e.into());
            }

            old.node.removed.store(true, Ordering::Release);
            if let Some(key) = old.timeout {
                st.timeouts.remove(key);
            }

            let node = Arc::new(Node::new(token, data));
            let timeout = deadline.map(|d| st.timeouts.insert(d, node.clone()));
            st.insert(
                fd,
                Registration {
                    node,
                    interest,
                    timeout,
                },
            );

            if let Some(deadline) = deadline {
                self.arm_if_first(&st, deadline);
            }

            (old.node, st.stopped)
        };

        trace!(poll = self.id, fd, "node modified");
        self.release(old, ResultState::Modified, stopped);
        Ok(())
    }

    fn delete(&self, fd: RawFd) -> bool {
        let (node, stopped) = {
            let mut st = self.state.lock();
            let Some(reg) = st.take(fd) else {
                return false;
            };

            reg.node.removed.store(true, Ordering::Release);
            if let Some(key) = reg.timeout {
                st.timeouts.remove(key);
            }
            if let Err(e) = self.poller.deregister(fd) {
                trace!(poll = self.id, fd, error = %e, "deregister failed");
            }

            (reg.node, st.stopped)
        };

        trace!(poll = self.id, fd, "node deleted");
        self.release(node, ResultState::Deleted, stopped);
        true
    }

    fn set_timeout(&self, fd: RawFd, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut guard = self.state.lock();
        let st = &mut *guard;

        let reg = st
            .table
            .get_mut(fd as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::NotRegistered(fd))?;

        if let Some(key) = reg.timeout.take() {
            st.timeouts.remove(key);
        }

        if let Some(deadline) = deadline {
            reg.timeout = Some(st.timeouts.insert(deadline, reg.node.clone()));
            self.arm_if_first(st, deadline);
        }

        Ok(())
    }

    fn add_timer(&self, after: Duration, context: C) -> Result<()> {
        let deadline = Instant::now() + after;

        let mut st = self.state.lock();
        if st.stopped {
            return Err(Error::Stopped);
        }

        let node = Arc::new(Node::new(0, PollData::timer(context)));
        st.timeouts.insert(deadline, node);
        self.arm_if_first(&st, deadline);

        trace!(poll = self.id, ?after, "timer added");
        Ok(())
    }

    /// Rearms the OS timer when `deadline` just became the earliest one.
    fn arm_if_first(&self, st: &State<C>, deadline: Instant) {
        if st.timeouts.next_deadline() == Some(deadline) {
            let after = deadline.saturating_duration_since(Instant::now());
            if let Err(e) = self.poller.arm_timer(Some(after)) {
                warn!(poll = self.id, error = %e, "failed to arm timer");
            }
        }
    }

    fn arm_timer(&self) {
        let st = self.state.lock();
        let after = st
            .timeouts
            .next_deadline()
            .map(|d| d.saturating_duration_since(Instant::now()));

        if let Err(e) = self.poller.arm_timer(after) {
            warn!(poll = self.id, error = %e, "failed to arm timer");
        }
    }

    /// Hands a node unregistered outside the loop thread to its result.
    ///
    /// While the loop runs the result goes through the command channel, so
    /// it is delivered after any event batch that already picked the node.
    fn release(&self, node: Arc<Node<C>>, state: ResultState, stopped: bool) {
        if stopped {
            self.deliver(&node, state, 0);
            return;
        }

        if let Err(failed) = self.sender.send(Command::Release { node, state }) {
            if let Command::Release { node, state } = failed.0 {
                self.deliver(&node, state, 0);
            }
            return;
        }

        self.waker.wake();
    }

    fn lookup(&self, token: u64) -> Option<Arc<Node<C>>> {
        let fd = (token & 0xffff_ffff) as u32 as RawFd;
        let st = self.state.lock();

        st.get(fd)
            .filter(|reg| reg.node.token == token)
            .map(|reg| reg.node.clone())
    }

    /// Unregisters a node from the loop thread.
    ///
    /// Returns `true` when another path already removed it, in which case
    /// that path owns the result.
    fn remove_node(&self, node: &Node<C>) -> bool {
        let mut st = self.state.lock();

        if node.removed.swap(true, Ordering::AcqRel) {
            return true;
        }

        if let Some(reg) = st.take_matching(node.fd, node.token) {
            if let Some(key) = reg.timeout {
                st.timeouts.remove(key);
            }
            let _ = self.poller.deregister(node.fd);
        }

        false
    }

    fn want(&self, node: &Node<C>, want: Want) {
        let interest = match want {
            Want::Read => Interest::READ,
            Want::Write => Interest::WRITE,
        };

        let mut st = self.state.lock();
        if node.removed.load(Ordering::Acquire) {
            return;
        }

        let Some(reg) = st
            .table
            .get_mut(node.fd as usize)
            .and_then(Option::as_mut)
            .filter(|reg| reg.node.token == node.token)
        else {
            return;
        };

        if reg.interest != interest {
            match self.poller.reregister(node.fd, node.token, interest) {
                Ok(()) => reg.interest = interest,
                Err(e) => warn!(poll = self.id, fd = node.fd, error = %e, "failed to flip interest"),
            }
        }
    }

    fn deliver(&self, node: &Node<C>, state: ResultState, error: i32) {
        if let Some(data) = node.data.lock().take() {
            self.handler.callback(PollResult { state, error, data });
        }
    }

    /// Emits a `Success` result that leaves the node registered.
    fn emit(&self, data: &PollData<C>, payload: Payload) {
        self.handler.callback(PollResult {
            state: ResultState::Success,
            error: 0,
            data: PollData {
                operation: data.operation,
                fd: data.fd,
                tls: data.tls.clone(),
                context: data.context.clone(),
                payload,
            },
        });
    }

    /// Feeds freshly read bytes into the node's inbound messages.
    fn feed(&self, data: &mut PollData<C>, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let Payload::Message(slot) = &mut data.payload else {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            };

            let message = match slot {
                Some(message) => message,
                None => slot.insert(self.handler.create_message(&data.context)?),
            };

            match message.append(buf)? {
                Appended::Incomplete => return Ok(()),
                Appended::Complete(consumed) => {
                    let message = slot.take();
                    buf = &buf[consumed.min(buf.len())..];
                    self.emit(data, Payload::Message(message));
                }
            }
        }

        Ok(())
    }
}

/// State private to the loop thread.
struct Looper<C> {
    shared: Arc<Shared<C>>,
    receiver: Receiver<Command<C>>,
    buffer: Vec<u8>,
    events: Vec<epoll_event>,
    tokens: Vec<u64>,
}

impl<C: Clone + Send + 'static> Looper<C> {
    fn new(shared: Arc<Shared<C>>, receiver: Receiver<Command<C>>) -> Self {
        Self {
            shared,
            receiver,
            buffer: vec![0; BUFFER_SIZE],
            events: Vec::new(),
            tokens: Vec::new(),
        }
    }

    /// Main loop.
    ///
    /// 1. Arm the timer to the nearest deadline
    /// 2. Block in `epoll_wait`
    /// 3. Handle every ready node
    /// 4. Deliver deferred releases, stop on shutdown
    /// 5. Expire deadlines once the timer fired
    fn run(&mut self) {
        debug!(poll = self.shared.id, "poll thread started");

        loop {
            self.shared.arm_timer();

            let mut tokens = std::mem::take(&mut self.tokens);
            tokens.clear();

            let wakeup = match self.shared.poller.poll(&mut self.events, &mut tokens) {
                Ok(wakeup) => wakeup,
                Err(e) => {
                    error!(poll = self.shared.id, error = %e, "epoll_wait failed");
                    break;
                }
            };

            for &token in &tokens {
                if let Some(node) = self.shared.lookup(token) {
                    self.dispatch(&node);
                }
            }
            self.tokens = tokens;

            if wakeup.woken && self.handle_commands() {
                break;
            }

            // The timer is always armed to the earliest deadline, so nothing
            // can expire without it firing.
            if wakeup.timer {
                self.handle_timeouts();
            }
        }

        debug!(poll = self.shared.id, "poll thread exiting");
    }

    fn dispatch(&mut self, node: &Arc<Node<C>>) {
        match node.operation {
            Operation::Read => self.handle_read(node),
            Operation::Write => self.handle_write(node),
            Operation::Listen => self.handle_listen(node),
            Operation::Connect => self.handle_connect(node),
            Operation::TlsAccept | Operation::TlsConnect | Operation::TlsShutdown => {
                self.handle_tls(node)
            }
            Operation::Event => self.handle_event(node),
            Operation::Notify => self.handle_notify(node),
            Operation::Timer => {}
        }
    }

    fn handle_commands(&mut self) -> bool {
        while let Ok(command) = self.receiver.try_recv() {
            match command {
                Command::Release { node, state } => self.shared.deliver(&node, state, 0),
                Command::Shutdown => return true,
            }
        }

        false
    }

    fn handle_timeouts(&mut self) {
        let now = Instant::now();

        let expired = {
            let mut st = self.shared.state.lock();
            let mut expired = Vec::new();

            while let Some((_, node)) = st.timeouts.pop_expired(now) {
                node.removed.store(true, Ordering::Release);
                if node.fd >= 0 && st.take_matching(node.fd, node.token).is_some() {
                    let _ = self.shared.poller.deregister(node.fd);
                }
                expired.push(node);
            }

            expired
        };

        for node in expired {
            trace!(poll = self.shared.id, fd = node.fd, "node timed out");
            self.shared.deliver(&node, ResultState::Error, libc::ETIMEDOUT);
        }
    }

    /// Resolves a node the loop thread finished with.
    fn finish(&self, node: &Node<C>, error: Option<i32>) {
        if self.shared.remove_node(node) {
            return;
        }

        match error {
            None => self.shared.deliver(node, ResultState::Finished, 0),
            Some(error) => self.shared.deliver(node, ResultState::Error, error),
        }
    }

    fn handle_read(&mut self, node: &Arc<Node<C>>) {
        let mut guard = node.data.lock();
        let Some(data) = guard.as_mut() else {
            return;
        };

        let error = loop {
            let read = match &data.tls {
                Some(tls) => tls.lock().read(&mut self.buffer),
                None => sys_read(node.fd, &mut self.buffer).map_err(TlsError::Io),
            };

            match read {
                Ok(0) => break None,
                Ok(n) => {
                    if let Err(e) = self.shared.feed(data, &self.buffer[..n]) {
                        break Some(io_errno(&e));
                    }
                }
                Err(TlsError::Want(want)) => {
                    self.shared.want(node, want);
                    return;
                }
                Err(TlsError::Io(e)) => match e.kind() {
                    io::ErrorKind::WouldBlock => return,
                    io::ErrorKind::Interrupted => continue,
                    _ => break Some(io_errno(&e)),
                },
            }
        };

        drop(guard);
        self.finish(node, error);
    }

    fn handle_write(&mut self, node: &Arc<Node<C>>) {
        let mut guard = node.data.lock();
        let Some(data) = guard.as_mut() else {
            return;
        };

        let PollData {
            fd,
            tls,
            context,
            payload,
            ..
        } = data;
        let Payload::Write(buffers) = payload else {
            return;
        };

        let mut written = 0;
        let mut error = None;

        while let Some(front) = buffers.front() {
            let result = match tls {
                Some(tls) => tls.lock().write(front),
                None => {
                    let slices: Vec<IoSlice<'_>> = buffers
                        .iter()
                        .take(IOV_MAX)
                        .map(|b| IoSlice::new(b))
                        .collect();
                    sys_writev(*fd, &slices).map_err(TlsError::Io)
                }
            };

            match result {
                Ok(n) => {
                    written += n;
                    advance(buffers, n);
                }
                Err(TlsError::Want(want)) => {
                    self.shared.want(node, want);
                    break;
                }
                Err(TlsError::Io(e)) => match e.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => {
                        error = Some(io_errno(&e));
                        break;
                    }
                },
            }
        }

        if error.is_none() && !buffers.is_empty() {
            if written == 0 {
                return;
            }

            match self.shared.handler.partial_written(written, context) {
                Ok(()) => return,
                Err(e) => error = Some(io_errno(&e)),
            }
        }

        drop(guard);
        self.finish(node, error);
    }

    fn handle_listen(&mut self, node: &Arc<Node<C>>) {
        let error = loop {
            match sys_accept(node.fd) {
                Ok((fd, addr)) => {
                    // SAFETY: `accept4` returned a fresh descriptor nobody else owns.
                    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
                    let guard = node.data.lock();
                    let Some(data) = guard.as_ref() else {
                        return;
                    };

                    self.shared.emit(data, Payload::Accepted { fd, addr });
                }
                Err(e) => match e.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EMFILE) | Some(libc::ENFILE) => return,
                    Some(libc::ECONNABORTED) | Some(libc::EINTR) => continue,
                    _ => break io_errno(&e),
                },
            }
        };

        warn!(poll = self.shared.id, fd = node.fd, error, "accept failed");
        self.finish(node, Some(error));
    }

    fn handle_connect(&mut self, node: &Arc<Node<C>>) {
        let error = match sys_socket_error(node.fd) {
            Ok(0) => None,
            Ok(error) => Some(error),
            Err(e) => Some(io_errno(&e)),
        };

        self.finish(node, error);
    }

    fn handle_tls(&mut self, node: &Arc<Node<C>>) {
        let tls = node.data.lock().as_ref().and_then(|data| data.tls.clone());
        let Some(tls) = tls else {
            self.finish(node, Some(libc::EINVAL));
            return;
        };

        let result = {
            let mut stream = tls.lock();
            match node.operation {
                Operation::TlsAccept => stream.accept(),
                Operation::TlsConnect => stream.connect(),
                _ => stream.shutdown(),
            }
        };

        match result {
            Ok(()) => self.finish(node, None),
            Err(TlsError::Want(want)) => self.shared.want(node, want),
            Err(TlsError::Io(e)) => self.finish(node, Some(io_errno(&e))),
        }
    }

    fn handle_event(&mut self, node: &Arc<Node<C>>) {
        let error = loop {
            let mut buf = [0u8; 8];
            match sys_read(node.fd, &mut buf) {
                Ok(8) => {
                    let guard = node.data.lock();
                    let Some(data) = guard.as_ref() else {
                        return;
                    };
                    self.shared.emit(data, Payload::Value(u64::from_ne_bytes(buf)));
                }
                Ok(_) => break libc::EIO,
                Err(e) => match e.kind() {
                    io::ErrorKind::WouldBlock => return,
                    io::ErrorKind::Interrupted => continue,
                    _ => break io_errno(&e),
                },
            }
        };

        self.finish(node, Some(error));
    }

    fn handle_notify(&mut self, node: &Arc<Node<C>>) {
        let mut buf = [0u8; 8 * 64];

        let error = loop {
            match sys_read(node.fd, &mut buf) {
                Ok(0) => break None,
                Ok(n) => {
                    let guard = node.data.lock();
                    let Some(data) = guard.as_ref() else {
                        return;
                    };

                    for chunk in buf[..n].chunks_exact(8) {
                        let mut value = [0u8; 8];
                        value.copy_from_slice(chunk);
                        self.shared.emit(data, Payload::Value(u64::from_ne_bytes(value)));
                    }
                }
                Err(e) => match e.kind() {
                    io::ErrorKind::WouldBlock => return,
                    io::ErrorKind::Interrupted => continue,
                    _ => break Some(io_errno(&e)),
                },
            }
        };

        self.finish(node, error);
    }
}

/// Drops `n` written bytes from the front of the buffer list.
pub(crate) fn advance(buffers: &mut VecDeque<Bytes>, mut n: usize) {
    while n > 0 {
        let Some(front) = buffers.front_mut() else {
            return;
        };

        if front.len() <= n {
            n -= front.len();
            buffers.pop_front();
        } else {
            front.advance(n);
            n = 0;
        }
    }
}
