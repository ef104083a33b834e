use super::TaskState;
use super::sub_task::{SubTask, TaskLink, next_in_series, sub_task_done};
use crate::comm::{SleepSession, SleepState};
use crate::sched::CommScheduler;
use crate::Error;

use std::sync::Arc;
use std::time::Duration;

pub type TimerCallback = Box<dyn FnOnce(&TimerTask) + Send>;

/// A task that completes after a fixed delay.
///
/// The state is [`TaskState::Success`] when the timer fired and
/// [`TaskState::Aborted`] when the scheduler shut down first.
pub struct TimerTask {
    link: TaskLink,
    scheduler: Arc<CommScheduler>,
    duration: Duration,
    state: TaskState,
    error: i32,
    callback: Option<TimerCallback>,
}

impl TimerTask {
    pub fn new(
        scheduler: Arc<CommScheduler>,
        duration: Duration,
        callback: Option<TimerCallback>,
    ) -> Box<Self> {
        Box::new(Self {
            link: TaskLink::new(),
            scheduler,
            duration,
            state: TaskState::Undefined,
            error: 0,
            callback,
        })
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn error(&self) -> i32 {
        self.error
    }

    pub fn set_callback(&mut self, callback: TimerCallback) {
        self.callback = Some(callback);
    }
}

impl SleepSession for TimerTask {
    fn duration(&self) -> Duration {
        self.duration
    }

    fn handle(mut self: Box<Self>, state: SleepState, error: i32) {
        self.state = match state {
            SleepState::Complete => TaskState::Success,
            SleepState::Disrupted => TaskState::Aborted,
            SleepState::Error => TaskState::SysError,
        };
        self.error = error;

        sub_task_done(self);
    }
}

impl SubTask for TimerTask {
    fn dispatch(self: Box<Self>) {
        let scheduler = self.scheduler.clone();

        if let Err(rejected) = scheduler.sleep(self) {
            let state = match &rejected.error {
                Error::Stopped => SleepState::Disrupted,
                _ => SleepState::Error,
            };
            rejected.session.handle(state, rejected.error.errno());
        }
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

impl std::fmt::Debug for TimerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerTask")
            .field("duration", &self.duration)
            .field("state", &self.state)
            .finish()
    }
}
