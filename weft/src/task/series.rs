use super::sub_task::SubTask;

use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Runs once when a series runs out of tasks.
pub type SeriesCallback = Box<dyn FnOnce(&SeriesWork) + Send>;

struct SeriesQueue {
    first: Option<Box<dyn SubTask>>,
    tasks: VecDeque<Box<dyn SubTask>>,
    last: Option<Box<dyn SubTask>>,
}

/// An ordered chain of tasks, each dispatched after the previous one is
/// done.
///
/// The series owns every task still waiting in it. A task learns about its
/// series when it is popped, so queued tasks never keep their series alive;
/// the series goes away with the last running task that refers to it, or
/// with the [`ParallelWork`](super::ParallelWork) it is a branch of.
///
/// A series that is never started must be [`dismiss`](Self::dismiss)ed to
/// release its tasks without running them.
pub struct SeriesWork {
    queue: Mutex<SeriesQueue>,
    callback: Mutex<Option<SeriesCallback>>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
    canceled: AtomicBool,
    finished: AtomicBool,
    in_parallel: AtomicBool,
}

impl SeriesWork {
    /// Creates a series that will start with `first`.
    pub fn new(first: Box<dyn SubTask>, callback: Option<SeriesCallback>) -> Arc<Self> {
        Arc::new(Self::with_first(Some(first), callback))
    }

    /// Creates and immediately runs a series.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// SeriesWork::start(
    ///     runtime.timer_task(Duration::from_millis(10), |_| {}),
    ///     Some(Box::new(|series| println!("finished: {}", series.is_finished()))),
    /// );
    /// ```
    pub fn start(first: Box<dyn SubTask>, callback: Option<SeriesCallback>) {
        Self::new(first, callback).run();
    }

    /// A series with nothing to start with, fed through its queue only.
    pub(crate) fn empty() -> Arc<Self> {
        Arc::new(Self::with_first(None, None))
    }

    fn with_first(first: Option<Box<dyn SubTask>>, callback: Option<SeriesCallback>) -> Self {
        Self {
            queue: Mutex::new(SeriesQueue {
                first,
                tasks: VecDeque::with_capacity(4),
                last: None,
            }),
            callback: Mutex::new(callback),
            context: Mutex::new(None),
            canceled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            in_parallel: AtomicBool::new(false),
        }
    }

    /// Dispatches the first task.
    ///
    /// Does nothing if the series was already started or belongs to a
    /// parallel work, which starts it instead.
    pub fn run(self: &Arc<Self>) {
        debug_assert!(!self.is_in_parallel(), "branch series are started by their parallel work");
        if self.is_in_parallel() {
            return;
        }

        if let Some(first) = self.take_first() {
            first.dispatch();
        } else if let Some(next) = self.pop() {
            next.dispatch();
        }
    }

    /// Drops a series that was never started, with all of its tasks, and
    /// without running its callback.
    pub fn dismiss(&self) {
        self.callback.lock().take();

        let mut queue = self.queue.lock();
        let first = queue.first.take();
        let tasks = std::mem::take(&mut queue.tasks);
        let last = queue.last.take();
        drop(queue);

        drop((first, tasks, last));
    }

    pub fn push_back(&self, task: Box<dyn SubTask>) {
        self.queue.lock().tasks.push_back(task);
    }

    pub fn push_front(&self, task: Box<dyn SubTask>) {
        self.queue.lock().tasks.push_front(task);
    }

    /// Sets the task that runs once the queue is empty.
    pub fn set_last(&self, task: Box<dyn SubTask>) {
        self.queue.lock().last = Some(task);
    }

    /// Removes the last task, returning it.
    pub fn unset_last(&self) -> Option<Box<dyn SubTask>> {
        self.queue.lock().last.take()
    }

    /// Returns the next task to dispatch.
    ///
    /// Once the queue and the last task are exhausted the series is
    /// finished and its callback runs, on the calling thread. A canceled
    /// series drops every task left instead of returning it.
    pub fn pop(self: &Arc<Self>) -> Option<Box<dyn SubTask>> {
        if self.is_canceled() {
            while self.pop_task().is_some() {}
            return None;
        }

        self.pop_task()
    }

    fn pop_task(self: &Arc<Self>) -> Option<Box<dyn SubTask>> {
        let task = {
            let mut queue = self.queue.lock();
            queue.tasks.pop_front().or_else(|| queue.last.take())
        };

        match task {
            Some(mut task) => {
                task.link_mut().series = Some(self.clone());
                Some(task)
            }
            None => {
                self.finish();
                None
            }
        }
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::Release);

        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback(self);
        }
    }

    /// Takes the first task, linked to this series.
    pub(crate) fn take_first(self: &Arc<Self>) -> Option<Box<dyn SubTask>> {
        let mut first = self.queue.lock().first.take()?;
        first.link_mut().series = Some(self.clone());
        Some(first)
    }

    pub fn set_callback(&self, callback: SeriesCallback) {
        *self.callback.lock() = Some(callback);
    }

    /// Stops the series after the task currently running.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Whether the series ran out of tasks.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn set_context<T: Any + Send>(&self, value: T) {
        *self.context.lock() = Some(Box::new(value));
    }

    pub fn take_context(&self) -> Option<Box<dyn Any + Send>> {
        self.context.lock().take()
    }

    /// Runs `f` on the context if it is a `T`.
    pub fn with_context<T: Any + Send, R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut context = self.context.lock();
        f(context.as_mut().and_then(|c| c.downcast_mut::<T>()))
    }

    /// Number of tasks waiting in the queue, the last task excluded.
    pub fn len(&self) -> usize {
        self.queue.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_in_parallel(&self) -> bool {
        self.in_parallel.load(Ordering::Acquire)
    }

    /// Marks the series as a branch; false if it already was one.
    pub(crate) fn join_parallel(&self) -> bool {
        !self.in_parallel.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn leave_parallel(&self) {
        self.in_parallel.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for SeriesWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesWork")
            .field("queued", &self.len())
            .field("canceled", &self.is_canceled())
            .field("finished", &self.is_finished())
            .finish()
    }
}
