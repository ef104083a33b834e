use super::series::SeriesWork;
use super::sub_task::{ParallelShared, Parent, SubTask, TaskLink, next_in_series, sub_task_done};
use crate::{Error, Result};

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Runs once every branch of a parallel work finished.
pub type ParallelCallback = Box<dyn FnOnce(&ParallelWork) + Send>;

/// A task made of several series running concurrently.
///
/// Dispatching starts every branch series. The parallel work completes,
/// running its callback and resuming its own series, after the last branch
/// finished. Branches can be inspected from the callback through
/// [`series_at`](Self::series_at).
pub struct ParallelWork {
    link: TaskLink,
    series: Vec<Arc<SeriesWork>>,
    shared: Arc<ParallelShared>,
    callback: Option<ParallelCallback>,
    context: Option<Box<dyn Any + Send>>,
}

impl ParallelWork {
    pub fn new(callback: Option<ParallelCallback>) -> Box<Self> {
        Box::new(Self {
            link: TaskLink::new(),
            series: Vec::with_capacity(4),
            shared: ParallelShared::new(),
            callback,
            context: None,
        })
    }

    /// Creates a parallel work over `series`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyInParallel`] if one of them is already a
    /// branch somewhere; none of them is kept in that case.
    pub fn with_series(
        series: impl IntoIterator<Item = Arc<SeriesWork>>,
        callback: Option<ParallelCallback>,
    ) -> Result<Box<Self>> {
        let mut parallel = Self::new(callback);
        for s in series {
            parallel.add_series(s)?;
        }
        Ok(parallel)
    }

    /// Adds a branch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyInParallel`] if the series is already a
    /// branch of a parallel work.
    pub fn add_series(&mut self, series: Arc<SeriesWork>) -> Result<()> {
        if !series.join_parallel() {
            return Err(Error::AlreadyInParallel);
        }

        self.series.push(series);
        Ok(())
    }

    /// Number of branches.
    pub fn size(&self) -> usize {
        self.series.len()
    }

    pub fn series_at(&self, index: usize) -> Option<&Arc<SeriesWork>> {
        self.series.get(index)
    }

    pub fn set_callback(&mut self, callback: ParallelCallback) {
        self.callback = Some(callback);
    }

    pub fn set_context<T: Any + Send>(&mut self, value: T) {
        self.context = Some(Box::new(value));
    }

    pub fn context<T: Any + Send>(&self) -> Option<&T> {
        self.context.as_ref().and_then(|c| c.downcast_ref::<T>())
    }

    /// Runs the parallel work in a series of its own.
    pub fn start(self: Box<Self>) {
        SeriesWork::start(self, None);
    }

    /// Drops a parallel work that was never started, with its branches.
    pub fn dismiss(self: Box<Self>) {
        drop(self);
    }
}

impl SubTask for ParallelWork {
    fn dispatch(self: Box<Self>) {
        // A branch fed only through its queue starts with the queue head;
        // one with no task at all finishes on the spot and is not waited on.
        let firsts: Vec<_> = self
            .series
            .iter()
            .enumerate()
            .filter_map(|(slot, series)| {
                series
                    .take_first()
                    .or_else(|| series.pop())
                    .map(|task| (slot, task))
            })
            .collect();

        if firsts.is_empty() {
            sub_task_done(self);
            return;
        }

        let shared = self.shared.clone();
        shared.left.store(firsts.len(), Ordering::Release);
        *shared.parked.lock() = Some(self as Box<dyn SubTask>);

        for (slot, mut task) in firsts {
            task.link_mut().parent = Parent::ChildOf {
                parent: shared.clone(),
                slot,
            };
            task.dispatch();
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

impl Drop for ParallelWork {
    fn drop(&mut self) {
        for series in self.series.drain(..) {
            series.leave_parallel();
            series.dismiss();
        }
    }
}

impl std::fmt::Debug for ParallelWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelWork")
            .field("size", &self.size())
            .field("link", &self.link)
            .finish()
    }
}
