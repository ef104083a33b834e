use super::pool::{Job, ThreadPool};
use crate::error::Result;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::trace;

/// Outcome of an [`ExecSession`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecState {
    Finished,
    /// The executor shut down before the session ran.
    Canceled,
}

/// A blocking or CPU-bound computation run on an [`Executor`].
pub trait ExecSession: Send {
    fn execute(&mut self);

    /// Receives the outcome exactly once, after `execute` or instead of it.
    fn handle(self: Box<Self>, state: ExecState, error: i32);
}

#[derive(Default)]
struct QueueState {
    sessions: VecDeque<Box<dyn ExecSession>>,
    scheduled: bool,
}

/// A serial lane on an [`Executor`].
///
/// Sessions of one queue run one at a time in submission order; separate
/// queues share the pool's threads.
#[derive(Default)]
pub struct ExecQueue {
    state: Mutex<QueueState>,
}

impl ExecQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().sessions.is_empty()
    }
}

/// Pool of compute threads running [`ExecSession`]s.
pub struct Executor {
    pool: Arc<ThreadPool>,
}

impl Executor {
    pub fn new(threads: usize) -> Result<Self> {
        Ok(Self {
            pool: Arc::new(ThreadPool::new("weft-compute", threads)?),
        })
    }

    /// Appends `session` to `queue`, scheduling the queue if it was idle.
    pub fn request(&self, session: Box<dyn ExecSession>, queue: &Arc<ExecQueue>) {
        let schedule = {
            let mut state = queue.state.lock();
            state.sessions.push_back(session);
            !std::mem::replace(&mut state.scheduled, true)
        };

        if schedule {
            self.pool.schedule(Box::new(ExecJob {
                queue: queue.clone(),
                pool: Arc::downgrade(&self.pool),
            }));
        }
    }

    pub fn increase_thread(&self) -> Result<()> {
        self.pool.increase()
    }

    /// Whether the caller runs on one of this executor's threads.
    pub fn in_executor(&self) -> bool {
        self.pool.in_pool()
    }

    /// Stops the pool; queued sessions resolve as [`ExecState::Canceled`].
    pub fn destroy(&self) {
        self.pool.destroy();
    }
}

/// Drives one [`ExecQueue`]: runs its head session, then reschedules
/// itself while sessions remain.
struct ExecJob {
    queue: Arc<ExecQueue>,
    pool: Weak<ThreadPool>,
}

impl Job for ExecJob {
    fn run(self: Box<Self>) {
        let session = self.queue.state.lock().sessions.pop_front();

        if let Some(mut session) = session {
            session.execute();
            session.handle(ExecState::Finished, 0);
        }

        let more = {
            let mut state = self.queue.state.lock();
            state.scheduled = !state.sessions.is_empty();
            state.scheduled
        };

        if more {
            match self.pool.upgrade() {
                Some(pool) => pool.schedule(self),
                None => self.cancel(),
            }
        }
    }

    fn cancel(self: Box<Self>) {
        let sessions = {
            let mut state = self.queue.state.lock();
            state.scheduled = false;
            std::mem::take(&mut state.sessions)
        };

        trace!(sessions = sessions.len(), "exec queue canceled");
        for session in sessions {
            session.handle(ExecState::Canceled, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct Record {
        id: usize,
        log: Arc<Mutex<Vec<usize>>>,
        done: mpsc::Sender<ExecState>,
    }

    impl ExecSession for Record {
        fn execute(&mut self) {
            self.log.lock().push(self.id);
        }

        fn handle(self: Box<Self>, state: ExecState, _error: i32) {
            let _ = self.done.send(state);
        }
    }

    #[test]
    fn one_queue_runs_in_order() {
        let executor = Executor::new(4).unwrap();
        let queue = ExecQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();

        for id in 0..32 {
            executor.request(
                Box::new(Record {
                    id,
                    log: log.clone(),
                    done: tx.clone(),
                }),
                &queue,
            );
        }

        for _ in 0..32 {
            assert_eq!(rx.recv().unwrap(), ExecState::Finished);
        }
        assert_eq!(*log.lock(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn requests_after_destroy_are_canceled() {
        let executor = Executor::new(1).unwrap();
        let queue = ExecQueue::new();
        let (tx, rx) = mpsc::channel();

        executor.destroy();
        executor.request(
            Box::new(Record {
                id: 0,
                log: Arc::new(Mutex::new(Vec::new())),
                done: tx,
            }),
            &queue,
        );

        assert_eq!(rx.recv().unwrap(), ExecState::Canceled);
        assert!(queue.is_empty());
    }
}
