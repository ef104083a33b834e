use super::series::SeriesWork;

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One unit of asynchronous work in a task graph.
///
/// A task is owned by whoever holds its `Box`: the series queue it waits
/// in, then the operation it is running, then [`sub_task_done`]. The
/// lifecycle is always:
///
/// 1. [`dispatch`](Self::dispatch) starts the work and hands the box to
///    whatever completes it (a session, a timer, a counter...).
/// 2. The completer passes the box to [`sub_task_done`].
/// 3. [`done`](Self::done) consumes the result and returns the task to run
///    next, usually by popping the series.
///
/// # Example
///
/// ```rust,ignore
/// struct Noop { link: TaskLink }
///
/// impl SubTask for Noop {
///     fn dispatch(self: Box<Self>) {
///         sub_task_done(self);
///     }
///
///     fn done(self: Box<Self>) -> Option<Box<dyn SubTask>> {
///         self.link.series().and_then(|s| s.pop())
///     }
///
///     fn link(&self) -> &TaskLink { &self.link }
///     fn link_mut(&mut self) -> &mut TaskLink { &mut self.link }
/// }
/// ```
pub trait SubTask: Send + 'static {
    fn dispatch(self: Box<Self>);

    fn done(self: Box<Self>) -> Option<Box<dyn SubTask>>;

    fn link(&self) -> &TaskLink;

    fn link_mut(&mut self) -> &mut TaskLink;
}

/// Completion bookkeeping of a parallel work while its branches run.
pub(crate) struct ParallelShared {
    pub(crate) left: AtomicUsize,

    /// The parallel work itself, parked until its last branch finishes.
    pub(crate) parked: Mutex<Option<Box<dyn SubTask>>>,
}

impl ParallelShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            left: AtomicUsize::new(0),
            parked: Mutex::new(None),
        })
    }
}

/// Where a running task reports when its chain ends.
#[derive(Clone, Default)]
pub(crate) enum Parent {
    #[default]
    Standalone,
    /// Branch `slot` of a parallel work.
    ChildOf {
        parent: Arc<ParallelShared>,
        slot: usize,
    },
}

/// Graph position of a task: its series and, inside a parallel work, its
/// branch. Every [`SubTask`] embeds one.
#[derive(Default)]
pub struct TaskLink {
    pub(crate) series: Option<Arc<SeriesWork>>,
    pub(crate) parent: Parent,
}

impl TaskLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The series the task is running in, once popped or started.
    pub fn series(&self) -> Option<&Arc<SeriesWork>> {
        self.series.as_ref()
    }

    /// Index of the parallel branch this task runs in, if any.
    pub fn branch(&self) -> Option<usize> {
        match &self.parent {
            Parent::Standalone => None,
            Parent::ChildOf { slot, .. } => Some(*slot),
        }
    }
}

impl std::fmt::Debug for TaskLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLink")
            .field("in_series", &self.series.is_some())
            .field("branch", &self.branch())
            .finish()
    }
}

/// Resumes the graph after `task` finished its work.
///
/// Calls `done` and dispatches whatever it returns in the same position.
/// When a parallel branch runs dry, the branch count of its parallel work
/// drops, and the last branch resumes the parallel work itself.
pub fn sub_task_done(task: Box<dyn SubTask>) {
    let mut cur = task;

    loop {
        let parent = cur.link().parent.clone();

        match cur.done() {
            Some(mut next) => {
                next.link_mut().parent = parent;
                next.dispatch();
            }
            None => {
                if let Parent::ChildOf { parent, .. } = parent {
                    if parent.left.fetch_sub(1, Ordering::AcqRel) == 1 {
                        if let Some(parallel) = parent.parked.lock().take() {
                            cur = parallel;
                            continue;
                        }
                    }
                }
            }
        }

        break;
    }
}

/// Pops the next task of the series `link` belongs to.
///
/// The usual tail of a [`SubTask::done`] implementation.
pub fn next_in_series(link: &TaskLink) -> Option<Box<dyn SubTask>> {
    link.series.as_ref().and_then(|series| series.pop())
}
