use super::sub_task::{SubTask, TaskLink, next_in_series, sub_task_done};
use super::{TaskState, TimeoutReason};
use crate::Error;
use crate::comm::{
    CommSession, CommTarget, Connection, MessageIn, MessageOut, SessionCore, SessionState,
};
use crate::sched::{CommScheduler, RequestObject};

use std::sync::Arc;
use std::time::Duration;

pub type ClientCallback<Req, Resp> = Box<dyn FnOnce(&mut ClientTask<Req, Resp>) + Send>;

/// Session state of a task rejected before it reached the wire.
pub(crate) fn rejected_state(error: &Error) -> SessionState {
    match error {
        Error::Stopped => SessionState::Stopped,
        _ => SessionState::Error,
    }
}

/// Maps a terminal session state onto the task state.
pub(crate) fn task_state(state: SessionState) -> TaskState {
    match state {
        SessionState::Success => TaskState::Success,
        SessionState::Error => TaskState::SysError,
        SessionState::Stopped => TaskState::Aborted,
        SessionState::ToReply => TaskState::ToReply,
    }
}

/// A client request: sends `Req` to a target drawn from a
/// [`RequestObject`] and reads the answer into `Resp`.
///
/// All timeouts default to unlimited, except the keep-alive which defaults
/// to closing the connection after the exchange.
///
/// # Example
///
/// ```rust,ignore
/// let target = SchedTarget::new(CommTarget::new(addr), 8)?;
/// let task = runtime.client_task(target, Echo::from("ping"), |task| {
///     if task.state() == TaskState::Success {
///         println!("{:?}", task.resp());
///     }
/// });
/// SeriesWork::start(task, None);
/// ```
pub struct ClientTask<Req, Resp> {
    link: TaskLink,
    core: SessionCore,
    scheduler: Arc<CommScheduler>,
    object: Arc<dyn RequestObject>,
    req: Req,
    resp: Resp,

    send_timeout: Option<Duration>,
    receive_timeout: Option<Duration>,
    keep_alive_timeout: Option<Duration>,
    wait_timeout: Option<Duration>,

    /// The request was handed its outbound message at least once.
    encoded: bool,

    state: TaskState,
    error: i32,
    timeout_reason: TimeoutReason,
    callback: Option<ClientCallback<Req, Resp>>,
}

impl<Req, Resp> ClientTask<Req, Resp>
where
    Req: MessageOut + 'static,
    Resp: MessageIn + Default + 'static,
{
    pub fn new(
        scheduler: Arc<CommScheduler>,
        object: Arc<dyn RequestObject>,
        req: Req,
        callback: Option<ClientCallback<Req, Resp>>,
    ) -> Box<Self> {
        Box::new(Self {
            link: TaskLink::new(),
            core: SessionCore::new(),
            scheduler,
            object,
            req,
            resp: Resp::default(),
            send_timeout: None,
            receive_timeout: None,
            keep_alive_timeout: Some(Duration::ZERO),
            wait_timeout: None,
            encoded: false,
            state: TaskState::Undefined,
            error: 0,
            timeout_reason: TimeoutReason::NotTimeout,
            callback,
        })
    }
}

impl<Req, Resp> ClientTask<Req, Resp> {
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

    /// Errno-style code of a failed request, 0 otherwise.
    pub fn error(&self) -> i32 {
        self.error
    }

    /// Which phase ran out of time, meaningful when the error is
    /// `ETIMEDOUT`.
    pub fn timeout_reason(&self) -> TimeoutReason {
        self.timeout_reason
    }

    /// The target the request went to, if one was acquired.
    pub fn target(&self) -> Option<&Arc<CommTarget>> {
        self.core.target()
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.core.connection()
    }

    /// Position of the exchange on its connection.
    pub fn seq(&self) -> u64 {
        self.core.seq()
    }

    pub fn set_send_timeout(&mut self, timeout: Option<Duration>) {
        self.send_timeout = timeout;
    }

    pub fn set_receive_timeout(&mut self, timeout: Option<Duration>) {
        self.receive_timeout = timeout;
    }

    /// How long the connection stays open for reuse afterwards.
    pub fn set_keep_alive(&mut self, timeout: Option<Duration>) {
        self.keep_alive_timeout = timeout;
    }

    /// How long to wait for a free slot on a saturated target.
    pub fn set_wait_timeout(&mut self, timeout: Option<Duration>) {
        self.wait_timeout = timeout;
    }

    pub fn set_callback(&mut self, callback: ClientCallback<Req, Resp>) {
        self.callback = Some(callback);
    }
}

impl<Req, Resp> CommSession for ClientTask<Req, Resp>
where
    Req: MessageOut + 'static,
    Resp: MessageIn + 'static,
{
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SessionCore {
        &mut self.core
    }

    fn message_out(&mut self) -> Option<&mut dyn MessageOut> {
        self.encoded = true;
        Some(&mut self.req)
    }

    fn message_in(&mut self) -> Option<&mut dyn MessageIn> {
        Some(&mut self.resp)
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
        debug_assert_ne!(state, SessionState::ToReply);

        self.state = task_state(state);
        self.error = error;
        self.timeout_reason = if error != libc::ETIMEDOUT {
            TimeoutReason::NotTimeout
        } else if self.core.target().is_none() {
            TimeoutReason::Wait
        } else if !self.encoded {
            TimeoutReason::Connect
        } else {
            TimeoutReason::Transmit
        };

        sub_task_done(self);
    }
}

impl<Req, Resp> SubTask for ClientTask<Req, Resp>
where
    Req: MessageOut + 'static,
    Resp: MessageIn + 'static,
{
    fn dispatch(self: Box<Self>) {
        let scheduler = self.scheduler.clone();
        let object = self.object.clone();
        let wait = self.wait_timeout;

        if let Err(rejected) = scheduler.request(self, &*object, wait) {
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

impl<Req, Resp> std::fmt::Debug for ClientTask<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTask")
            .field("state", &self.state)
            .field("error", &self.error)
            .field("timeout_reason", &self.timeout_reason)
            .finish()
    }
}
