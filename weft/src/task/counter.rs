use super::TaskState;
use super::sub_task::{SubTask, TaskLink, next_in_series, sub_task_done};

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub type CounterCallback = Box<dyn FnOnce(&CounterTask) + Send>;

struct CounterShared {
    /// Counts left, plus one for the dispatch itself.
    value: AtomicUsize,
    parked: Mutex<Option<Box<CounterTask>>>,
}

impl CounterShared {
    /// Takes one count; the count that reaches zero completes the task.
    fn count(&self) -> bool {
        let prev = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));

        if prev != Ok(1) {
            return false;
        }

        let parked = self.parked.lock().take();
        if let Some(mut task) = parked {
            task.state = TaskState::Success;
            sub_task_done(task);
        }

        true
    }
}

/// Handle through which a [`CounterTask`] is counted down.
///
/// Cheap to clone and safe to use from any thread. Counts past the target
/// are ignored.
#[derive(Clone)]
pub struct Counter {
    shared: Arc<CounterShared>,
}

impl Counter {
    /// Counts once. Returns whether this call completed the task.
    ///
    /// The task completes on the calling thread when both this was the
    /// last count and the task was already dispatched.
    pub fn count(&self) -> bool {
        self.shared.count()
    }

    /// Raises the target by one, unless the counter already completed.
    pub fn add_pending(&self) -> bool {
        self.shared
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v != 0).then(|| v + 1)
            })
            .is_ok()
    }

    /// Counts still needed, dispatch included.
    pub fn remaining(&self) -> usize {
        self.shared.value.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// A task that completes after being counted `target` times.
///
/// Counting may start before the task is dispatched; it completes once
/// both happened.
///
/// # Example
///
/// ```rust,ignore
/// let (task, counter) = CounterTask::new(2, None);
/// SeriesWork::start(task, None);
///
/// counter.count();
/// counter.count(); // completes here
/// ```
pub struct CounterTask {
    link: TaskLink,
    shared: Option<Arc<CounterShared>>,
    state: TaskState,
    callback: Option<CounterCallback>,
}

impl CounterTask {
    pub fn new(target: usize, callback: Option<CounterCallback>) -> (Box<Self>, Counter) {
        let shared = Arc::new(CounterShared {
            value: AtomicUsize::new(target.saturating_add(1)),
            parked: Mutex::new(None),
        });

        let task = Box::new(Self {
            link: TaskLink::new(),
            shared: Some(shared.clone()),
            state: TaskState::Undefined,
            callback,
        });

        (task, Counter { shared })
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn set_callback(&mut self, callback: CounterCallback) {
        self.callback = Some(callback);
    }
}

impl SubTask for CounterTask {
    fn dispatch(mut self: Box<Self>) {
        // The parked task must not hold its own slot.
        let Some(shared) = self.shared.take() else {
            debug_assert!(false, "counter task dispatched twice");
            return;
        };

        *shared.parked.lock() = Some(self);
        shared.count();
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

impl std::fmt::Debug for CounterTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterTask")
            .field("state", &self.state)
            .field("link", &self.link)
            .finish()
    }
}
