use super::client::{rejected_state, task_state};
use super::series::SeriesWork;
use super::sub_task::{SubTask, TaskLink, next_in_series, sub_task_done};
use super::{TaskState, TimeoutReason};
use crate::comm::{
    Binding, CommService, CommSession, Connection, MessageIn, MessageOut, ServiceConfig,
    SessionCore, SessionState,
};
use crate::sched::CommScheduler;
use crate::{Error, Result};

use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Handles one request: fills the response, or pushes tasks into the
/// series that ends with the reply.
pub type ProcessFn<Req, Resp> = dyn Fn(&mut ServerTask<Req, Resp>, &Arc<SeriesWork>) + Send + Sync;

pub type ServerCallback<Req, Resp> = Box<dyn FnOnce(&mut ServerTask<Req, Resp>) + Send>;

/// Runs right before the reply is sent, once the process series reached it.
pub type PrepareFn<Req, Resp> = Box<dyn FnOnce(&mut ServerTask<Req, Resp>, &SeriesWork) + Send>;

/// Head of a process series; only there so tasks pushed by the process
/// function run before the reply.
struct Processor {
    link: TaskLink,
}

impl SubTask for Processor {
    fn dispatch(self: Box<Self>) {
        sub_task_done(self);
    }

    fn done(self: Box<Self>) -> Option<Box<dyn SubTask>> {
        next_in_series(&self.link)
    }

    fn link(&self) -> &TaskLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut TaskLink {
        &mut self.link
    }
}

/// The passive side of one exchange, created by a [`Service`] for each
/// inbound request.
///
/// Once the request is read, the process function runs with the task and
/// a fresh series ending with it; the reply goes out when that series
/// reaches the task. The callback sees the outcome of the reply.
pub struct ServerTask<Req, Resp> {
    link: TaskLink,
    core: SessionCore,
    scheduler: Arc<CommScheduler>,
    process: Option<Arc<ProcessFn<Req, Resp>>>,
    req: Req,
    resp: Resp,

    send_timeout: Option<Duration>,
    receive_timeout: Option<Duration>,
    keep_alive_timeout: Option<Duration>,
    encoded: bool,

    state: TaskState,
    error: i32,
    timeout_reason: TimeoutReason,
    prepare: Option<PrepareFn<Req, Resp>>,
    callback: Option<ServerCallback<Req, Resp>>,
}

impl<Req, Resp> ServerTask<Req, Resp>
where
    Req: MessageIn + Default + 'static,
    Resp: MessageOut + Default + 'static,
{
    fn new(scheduler: Arc<CommScheduler>, process: Arc<ProcessFn<Req, Resp>>) -> Box<Self> {
        Box::new(Self {
            link: TaskLink::new(),
            core: SessionCore::new(),
            scheduler,
            process: Some(process),
            req: Req::default(),
            resp: Resp::default(),
            send_timeout: None,
            receive_timeout: None,
            keep_alive_timeout: Some(Duration::ZERO),
            encoded: false,
            state: TaskState::Undefined,
            error: 0,
            timeout_reason: TimeoutReason::NotTimeout,
            prepare: None,
            callback: None,
        })
    }
}

impl<Req, Resp> ServerTask<Req, Resp>
where
    Req: MessageIn + 'static,
    Resp: MessageOut + 'static,
{
    /// Streams `buf` to the peer ahead of the reply.
    ///
    /// # Errors
    ///
    /// Fails once the reply was issued, or with the socket error.
    pub fn push(&self, buf: &[u8]) -> Result<usize> {
        self.scheduler.push(buf, self)
    }
}

impl<Req, Resp> ServerTask<Req, Resp> {
    pub fn req(&self) -> &Req {
        &self.req
    }

    pub fn req_mut(&mut self) -> &mut Req {
        &mut self.req
    }

    pub fn resp(&self) -> &Resp {
        &self.resp
    }

    pub fn resp_mut(&mut self) -> &mut Resp {
        &mut self.resp
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn error(&self) -> i32 {
        self.error
    }

    pub fn timeout_reason(&self) -> TimeoutReason {
        self.timeout_reason
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.core.connection()
    }

    /// Position of the request on its connection, starting at 0.
    pub fn seq(&self) -> u64 {
        self.core.seq()
    }

    /// Skips the reply; the connection is closed when the task completes.
    pub fn no_reply(&mut self) {
        if self.state == TaskState::ToReply {
            self.state = TaskState::NoReply;
        }
    }

    pub fn set_send_timeout(&mut self, timeout: Option<Duration>) {
        self.send_timeout = timeout;
    }

    pub fn set_keep_alive(&mut self, timeout: Option<Duration>) {
        self.keep_alive_timeout = timeout;
    }

    pub fn set_prepare(&mut self, prepare: PrepareFn<Req, Resp>) {
        self.prepare = Some(prepare);
    }

    pub fn set_callback(&mut self, callback: ServerCallback<Req, Resp>) {
        self.callback = Some(callback);
    }
}

impl<Req, Resp> CommSession for ServerTask<Req, Resp>
where
    Req: MessageIn + 'static,
    Resp: MessageOut + 'static,
{
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SessionCore {
        &mut self.core
    }

    fn message_out(&mut self) -> Option<&mut dyn MessageOut> {
        self.encoded = true;
        Some(&mut self.resp)
    }

    fn message_in(&mut self) -> Option<&mut dyn MessageIn> {
        Some(&mut self.req)
    }

    fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout
    }

    fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout
    }

    fn keep_alive_timeout(&self) -> Option<Duration> {
        self.keep_alive_timeout
    }

    fn handle(mut self: Box<Self>, state: SessionState, error: i32) {
        if state == SessionState::ToReply {
            self.state = TaskState::ToReply;

            let series = SeriesWork::new(
                Box::new(Processor {
                    link: TaskLink::new(),
                }),
                None,
            );
            if let Some(process) = self.process.take() {
                process(&mut *self, &series);
            }

            series.set_last(self);
            series.run();
            return;
        }

        // A request that failed before it was read has nobody to report to.
        if self.state != TaskState::ToReply {
            return;
        }

        self.state = task_state(state);
        self.error = error;
        self.timeout_reason = if error == libc::ETIMEDOUT && self.encoded {
            TimeoutReason::Transmit
        } else {
            TimeoutReason::NotTimeout
        };

        sub_task_done(self);
    }
}

impl<Req, Resp> SubTask for ServerTask<Req, Resp>
where
    Req: MessageIn + 'static,
    Resp: MessageOut + 'static,
{
    fn dispatch(mut self: Box<Self>) {
        if let Some(prepare) = self.prepare.take() {
            if let Some(series) = self.link.series.clone() {
                prepare(&mut *self, &series);
            }
        }

        if self.state != TaskState::ToReply {
            sub_task_done(self);
            return;
        }

        let scheduler = self.scheduler.clone();
        if let Err(rejected) = scheduler.reply(self) {
            let state = rejected_state(&rejected.error);
            rejected.session.handle(state, rejected.error.errno());
        }
    }

    fn done(mut self: Box<Self>) -> Option<Box<dyn SubTask>> {
        if let Some(callback) = self.callback.take() {
            callback(&mut *self);
        }

        next_in_series(&self.link)
    }

    fn link(&self) -> &TaskLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut TaskLink {
        &mut self.link
    }
}

impl<Req, Resp> std::fmt::Debug for ServerTask<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTask")
            .field("seq", &self.core.seq())
            .field("state", &self.state)
            .field("error", &self.error)
            .finish()
    }
}

/// A server bound to a listening address, turning every inbound request
/// into a [`ServerTask`].
///
/// # Example
///
/// ```rust,ignore
/// let service = runtime.service(|task: &mut ServerTask<Echo, Echo>, _series| {
///     let body = task.req().body().clone();
///     task.resp_mut().set_body(body);
/// });
///
/// let binding = service.start(ServiceConfig::new("127.0.0.1:0".parse()?))?;
/// println!("listening on {}", binding.local_addr());
/// service.stop(binding);
/// ```
pub struct Service<Req, Resp> {
    scheduler: Weak<CommScheduler>,
    process: Arc<ProcessFn<Req, Resp>>,
    send_timeout: Option<Duration>,
    receive_timeout: Option<Duration>,
    keep_alive_timeout: Option<Duration>,
    unbound: Mutex<bool>,
    cond: Condvar,
}

impl<Req, Resp> Service<Req, Resp>
where
    Req: MessageIn + Default + 'static,
    Resp: MessageOut + Default + 'static,
{
    pub fn new<F>(scheduler: &Arc<CommScheduler>, process: F) -> Arc<Self>
    where
        F: Fn(&mut ServerTask<Req, Resp>, &Arc<SeriesWork>) + Send + Sync + 'static,
    {
        Self::with_timeouts(scheduler, process, None, None, Some(Duration::from_secs(60)))
    }

    /// Creates a service whose tasks start with the given timeouts.
    ///
    /// # Arguments
    ///
    /// * `send_timeout` - Limit for writing each reply.
    /// * `receive_timeout` - Limit for reading each request.
    /// * `keep_alive_timeout` - How long a connection may idle between
    ///   requests; zero closes it after each reply.
    pub fn with_timeouts<F>(
        scheduler: &Arc<CommScheduler>,
        process: F,
        send_timeout: Option<Duration>,
        receive_timeout: Option<Duration>,
        keep_alive_timeout: Option<Duration>,
    ) -> Arc<Self>
    where
        F: Fn(&mut ServerTask<Req, Resp>, &Arc<SeriesWork>) + Send + Sync + 'static,
    {
        Arc::new(Self {
            scheduler: Arc::downgrade(scheduler),
            process: Arc::new(process),
            send_timeout,
            receive_timeout,
            keep_alive_timeout,
            unbound: Mutex::new(true),
            cond: Condvar::new(),
        })
    }

    /// Binds the listener described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stopped`] when the scheduler is gone, or the socket
    /// error of the bind.
    pub fn start(self: &Arc<Self>, config: ServiceConfig) -> Result<Binding> {
        let scheduler = self.scheduler.upgrade().ok_or(Error::Stopped)?;

        *self.unbound.lock() = false;
        let service: Arc<dyn CommService> = self.clone();

        match scheduler.bind(config, service) {
            Ok(binding) => Ok(binding),
            Err(e) => {
                self.mark_unbound();
                Err(e)
            }
        }
    }

    /// Closes the listener. Connections still serving a request finish
    /// first; see [`wait_finish`](Self::wait_finish).
    pub fn shutdown(&self, binding: Binding) {
        match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.unbind(binding),
            None => drop(binding),
        }
    }

    /// Blocks until the listener and every connection it accepted are gone.
    pub fn wait_finish(&self) {
        let mut unbound = self.unbound.lock();
        while !*unbound {
            self.cond.wait(&mut unbound);
        }
    }

    /// [`shutdown`](Self::shutdown) then [`wait_finish`](Self::wait_finish).
    pub fn stop(&self, binding: Binding) {
        self.shutdown(binding);
        self.wait_finish();
    }

    fn mark_unbound(&self) {
        *self.unbound.lock() = true;
        self.cond.notify_all();
    }
}

impl<Req, Resp> CommService for Service<Req, Resp>
where
    Req: MessageIn + Default + 'static,
    Resp: MessageOut + Default + 'static,
{
    fn new_session(&self, _seq: u64, _conn: &Arc<Connection>) -> Option<Box<dyn CommSession>> {
        let scheduler = self.scheduler.upgrade()?;

        let mut task = ServerTask::new(scheduler, self.process.clone());
        task.send_timeout = self.send_timeout;
        task.receive_timeout = self.receive_timeout;
        task.keep_alive_timeout = self.keep_alive_timeout;

        Some(task)
    }

    fn handle_stop(&self, error: i32) {
        debug!(error, "service listener stopped");
    }

    fn handle_unbound(&self) {
        debug!("service unbound");
        self.mark_unbound();
    }
}

impl<Req, Resp> std::fmt::Debug for Service<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("unbound", &*self.unbound.lock())
            .field("keep_alive_timeout", &self.keep_alive_timeout)
            .finish()
    }
}
