use super::Runtime;
use crate::Result;
use crate::reactor::poller::unix::sys_max_open_files;

use std::thread;

const DEFAULT_POLLER_THREADS: usize = 4;
const DEFAULT_HANDLER_THREADS: usize = 20;
const FALLBACK_MAX_OPEN_FILES: usize = 65536;

/// Builder for configuring and creating a runtime.
///
/// `RuntimeBuilder` sizes the thread pools of the engine and the
/// descriptor table of its multiplexer before anything starts.
///
/// # Examples
///
/// ```rust,ignore
/// let runtime = RuntimeBuilder::new()
///     .poller_threads(2)
///     .handler_threads(8)
///     .build()?;
/// ```
#[derive(Clone, Debug)]
pub struct RuntimeBuilder {
    /// Multiplexer loop threads.
    pub(crate) poller_threads: usize,

    /// Threads running session callbacks and task graph resumption.
    pub(crate) handler_threads: usize,

    /// Threads of the executor behind go tasks.
    pub(crate) compute_threads: usize,

    /// Size of each multiplexer's descriptor table.
    pub(crate) max_open_files: usize,
}

impl RuntimeBuilder {
    /// Creates a new `RuntimeBuilder` with default configuration.
    ///
    /// Defaults to 4 poller threads, 20 handler threads, one compute
    /// thread per logical CPU, and a descriptor table as large as the
    /// process's soft `RLIMIT_NOFILE`.
    pub fn new() -> Self {
        let compute_threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let max_open_files = sys_max_open_files().unwrap_or(FALLBACK_MAX_OPEN_FILES);

        Self {
            poller_threads: DEFAULT_POLLER_THREADS,
            handler_threads: DEFAULT_HANDLER_THREADS,
            compute_threads,
            max_open_files,
        }
    }

    /// Sets the number of multiplexer threads.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn poller_threads(mut self, n: usize) -> Self {
        assert!(n > 0, "poller_threads must be > 0");

        self.poller_threads = n;
        self
    }

    /// Sets the number of handler threads.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn handler_threads(mut self, n: usize) -> Self {
        assert!(n > 0, "handler_threads must be > 0");

        self.handler_threads = n;
        self
    }

    /// Sets the number of compute threads.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let builder = RuntimeBuilder::new()
    ///     .compute_threads(2);
    /// ```
    pub fn compute_threads(mut self, n: usize) -> Self {
        assert!(n > 0, "compute_threads must be > 0");

        self.compute_threads = n;
        self
    }

    /// Sets how many descriptors each multiplexer can track.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn max_open_files(mut self, n: usize) -> Self {
        assert!(n > 0, "max_open_files must be > 0");

        self.max_open_files = n;
        self
    }

    /// Builds the runtime with the configured options.
    ///
    /// This starts the multiplexer loops and every thread pool.
    ///
    /// # Errors
    ///
    /// Returns the OS error when a thread, an epoll instance or an eventfd
    /// cannot be created.
    pub fn build(self) -> Result<Runtime> {
        Runtime::new(&self)
    }
}

impl Default for RuntimeBuilder {
    /// Creates a default `RuntimeBuilder`.
    fn default() -> Self {
        Self::new()
    }
}
