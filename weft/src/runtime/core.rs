use std::sync::Arc;
use std::time::Duration;

use super::builder::RuntimeBuilder;
use super::executor::{ExecQueue, Executor};
use crate::Result;
use crate::comm::{MessageIn, MessageOut};
use crate::sched::{CommScheduler, RequestObject};
use crate::task::{
    ClientTask, Counter, CounterTask, GoTask, GraphTask, SeriesWork, ServerTask, Service,
    TimerTask,
};

use tracing::debug;

/// The main runtime handle.
///
/// `Runtime` owns the two engines every task runs on:
/// - a [`CommScheduler`] (multiplexer loops, handler threads and the
///   connection state machine) for network and timer tasks,
/// - an [`Executor`] for go tasks.
///
/// It is also the factory for ready-to-run tasks. Dropping the runtime
/// shuts down the scheduler first, then the executor; tasks still in
/// flight complete as aborted.
pub struct Runtime {
    /// Network and timer engine.
    scheduler: Arc<CommScheduler>,

    /// Compute pool behind go tasks.
    executor: Arc<Executor>,
}

impl Runtime {
    /// Starts every engine with the sizes of `config`.
    pub(crate) fn new(config: &RuntimeBuilder) -> Result<Self> {
        let scheduler = Arc::new(CommScheduler::new(
            config.poller_threads,
            config.handler_threads,
            config.max_open_files,
        )?);
        let executor = Arc::new(Executor::new(config.compute_threads)?);

        debug!(
            poller_threads = config.poller_threads,
            handler_threads = config.handler_threads,
            compute_threads = config.compute_threads,
            "runtime started"
        );

        Ok(Self {
            scheduler,
            executor,
        })
    }

    pub fn scheduler(&self) -> &Arc<CommScheduler> {
        &self.scheduler
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Creates a task that completes after `duration`.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// runtime
    ///     .timer_task(Duration::from_millis(100), |t| assert_eq!(t.state(), TaskState::Success))
    ///     .start();
    /// ```
    pub fn timer_task<F>(&self, duration: Duration, callback: F) -> Box<TimerTask>
    where
        F: FnOnce(&TimerTask) + Send + 'static,
    {
        TimerTask::new(self.scheduler.clone(), duration, Some(Box::new(callback)))
    }

    /// Creates a task running `work` on the compute executor, serialized
    /// with the other work of `queue`.
    pub fn go_task<F>(&self, queue: &Arc<ExecQueue>, work: F) -> Box<GoTask>
    where
        F: FnOnce() + Send + 'static,
    {
        GoTask::new(self.executor.clone(), queue.clone(), work)
    }

    /// Creates a counter task and the handle that counts it down.
    pub fn counter_task<F>(&self, target: usize, callback: F) -> (Box<CounterTask>, Counter)
    where
        F: FnOnce(&CounterTask) + Send + 'static,
    {
        CounterTask::new(target, Some(Box::new(callback)))
    }

    pub fn graph_task<F>(&self, callback: F) -> Box<GraphTask>
    where
        F: FnOnce(&GraphTask) + Send + 'static,
    {
        GraphTask::new(Some(Box::new(callback)))
    }

    /// Creates a client request against `object`.
    ///
    /// # Arguments
    ///
    /// * `object` - Target or group the request acquires a slot from.
    /// * `req` - The outbound message.
    /// * `callback` - Runs once with the finished task.
    pub fn client_task<Req, Resp, F>(
        &self,
        object: Arc<dyn RequestObject>,
        req: Req,
        callback: F,
    ) -> Box<ClientTask<Req, Resp>>
    where
        Req: MessageOut + 'static,
        Resp: MessageIn + Default + 'static,
        F: FnOnce(&mut ClientTask<Req, Resp>) + Send + 'static,
    {
        ClientTask::new(self.scheduler.clone(), object, req, Some(Box::new(callback)))
    }

    /// Creates a service running `process` for every inbound request.
    pub fn service<Req, Resp, F>(&self, process: F) -> Arc<Service<Req, Resp>>
    where
        Req: MessageIn + Default + 'static,
        Resp: MessageOut + Default + 'static,
        F: Fn(&mut ServerTask<Req, Resp>, &Arc<SeriesWork>) + Send + Sync + 'static,
    {
        Service::new(&self.scheduler, process)
    }

    /// Stops every engine. Idempotent; also done on drop.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.executor.destroy();
    }
}

impl Drop for Runtime {
    /// Shuts down the runtime.
    ///
    /// This performs the following steps:
    /// 1. Stops the multiplexer loops, reporting live sessions as stopped
    /// 2. Joins the handler threads
    /// 3. Cancels pending compute work and joins the compute threads
    fn drop(&mut self) {
        self.shutdown();
        debug!("runtime stopped");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
