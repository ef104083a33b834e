use super::TaskState;
use super::sub_task::{SubTask, TaskLink, next_in_series, sub_task_done};
use crate::runtime::{ExecQueue, ExecSession, ExecState, Executor};

use std::sync::Arc;

pub type GoCallback = Box<dyn FnOnce(&GoTask) + Send>;

/// A task running a closure on an [`Executor`] queue.
///
/// Closures sharing an [`ExecQueue`] run one after another; the series
/// resumes on the compute thread that ran the closure.
pub struct GoTask {
    link: TaskLink,
    executor: Arc<Executor>,
    queue: Arc<ExecQueue>,
    work: Option<Box<dyn FnOnce() + Send>>,
    state: TaskState,
    callback: Option<GoCallback>,
}

impl GoTask {
    pub fn new<F>(executor: Arc<Executor>, queue: Arc<ExecQueue>, work: F) -> Box<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Box::new(Self {
            link: TaskLink::new(),
            executor,
            queue,
            work: Some(Box::new(work)),
            state: TaskState::Undefined,
            callback: None,
        })
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn set_callback(&mut self, callback: GoCallback) {
        self.callback = Some(callback);
    }
}

impl ExecSession for GoTask {
    fn execute(&mut self) {
        if let Some(work) = self.work.take() {
            work();
        }
    }

    fn handle(mut self: Box<Self>, state: ExecState, _error: i32) {
        self.state = match state {
            ExecState::Finished => TaskState::Success,
            ExecState::Canceled => TaskState::Aborted,
        };

        sub_task_done(self);
    }
}

impl SubTask for GoTask {
    fn dispatch(self: Box<Self>) {
        let executor = self.executor.clone();
        let queue = self.queue.clone();
        executor.request(self, &queue);
    }

    fn done(mut self: Box<Self>) -> Option<Box<dyn SubTask>> {
        if let Some(callback) = self.callback.take() {
            callback(&*self);
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

impl std::fmt::Debug for GoTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoTask")
            .field("state", &self.state)
            .field("pending", &self.work.is_some())
            .finish()
    }
}
