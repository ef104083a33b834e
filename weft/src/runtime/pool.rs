use super::context::{current_pool, enter_pool, next_pool_id};
use super::queue::MsgQueue;
use crate::error::Result;

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

/// A unit of work run by a [`ThreadPool`].
pub trait Job: Send {
    fn run(self: Box<Self>);

    /// Called instead of [`run`](Self::run) when the pool is destroyed
    /// before the job got a thread.
    fn cancel(self: Box<Self>) {}
}

struct FnJob<F>(F);

impl<F: FnOnce() + Send> Job for FnJob<F> {
    fn run(self: Box<Self>) {
        (self.0)()
    }
}

struct PoolShared {
    id: usize,
    name: String,
    queue: MsgQueue<Box<dyn Job>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// Fixed set of worker threads fed by one [`MsgQueue`] of jobs.
///
/// The pool can grow at runtime with [`increase`](Self::increase) but never
/// shrinks until it is destroyed.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// Creates a pool and spawns `threads` workers.
    ///
    /// # Arguments
    ///
    /// * `name` - Prefix of the worker thread names.
    /// * `threads` - Initial number of workers.
    ///
    /// # Errors
    ///
    /// Returns an error when a thread cannot be spawned; workers already
    /// started are shut down first.
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        let pool = Self {
            shared: Arc::new(PoolShared {
                id: next_pool_id(),
                name: name.to_owned(),
                queue: MsgQueue::new(),
                threads: Mutex::new(Vec::with_capacity(threads)),
                stopped: AtomicBool::new(false),
            }),
        };

        for _ in 0..threads {
            pool.increase()?;
        }

        debug!(pool = %pool.shared.name, threads, "thread pool started");
        Ok(pool)
    }

    /// Queues a job; after [`destroy`](Self::destroy) the job is cancelled
    /// right away.
    pub fn schedule(&self, job: Box<dyn Job>) {
        if self.shared.stopped.load(Ordering::Acquire) {
            job.cancel();
            return;
        }

        self.shared.queue.put(job);
    }

    /// Queues a closure.
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        self.schedule(Box::new(FnJob(f)));
    }

    /// Adds one worker thread.
    pub fn increase(&self) -> Result<()> {
        let mut threads = self.shared.threads.lock();
        let shared = self.shared.clone();
        let index = threads.len();

        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.shared.name, index))
            .spawn(move || enter_pool(shared.id, || worker(&shared)))?;

        threads.push(handle);
        trace!(pool = %self.shared.name, threads = threads.len(), "worker added");
        Ok(())
    }

    pub fn threads(&self) -> usize {
        self.shared.threads.lock().len()
    }

    /// Whether the calling thread is one of this pool's workers.
    pub fn in_pool(&self) -> bool {
        current_pool() == Some(self.shared.id)
    }

    /// Stops the workers and cancels every job that never ran.
    ///
    /// Jobs already running finish first. When called from one of the
    /// pool's own workers, that worker is detached instead of joined.
    pub fn destroy(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shared.queue.set_nonblock();

        let current = thread::current().id();
        let handles: Vec<_> = self.shared.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        let mut canceled = 0;
        while let Some(job) = self.shared.queue.try_get() {
            job.cancel();
            canceled += 1;
        }

        debug!(pool = %self.shared.name, canceled, "thread pool destroyed");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn worker(shared: &PoolShared) {
    while let Some(job) = shared.queue.get() {
        if shared.stopped.load(Ordering::Acquire) {
            job.cancel();
            break;
        }

        job.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use tracing_test::traced_test;

    struct Counted {
        ran: Arc<AtomicUsize>,
        canceled: Arc<AtomicUsize>,
    }

    impl Job for Counted {
        fn run(self: Box<Self>) {
            self.ran.fetch_add(1, Ordering::SeqCst);
        }

        fn cancel(self: Box<Self>) {
            self.canceled.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn jobs_run_inside_the_pool() {
        let pool = ThreadPool::new("test-pool", 2).unwrap();
        let (tx, rx) = mpsc::channel();

        let pool = Arc::new(pool);
        let inner = pool.clone();
        pool.spawn(move || tx.send(inner.in_pool()).unwrap());

        assert!(rx.recv().unwrap());
        assert!(!pool.in_pool());
    }

    #[test]
    fn destroy_cancels_jobs_scheduled_after_it() {
        let pool = ThreadPool::new("test-pool", 1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let canceled = Arc::new(AtomicUsize::new(0));

        pool.destroy();
        pool.schedule(Box::new(Counted {
            ran: ran.clone(),
            canceled: canceled.clone(),
        }));

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(canceled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn increase_adds_a_worker() {
        let pool = ThreadPool::new("test-pool", 1).unwrap();
        pool.increase().unwrap();
        assert_eq!(pool.threads(), 2);
    }

    #[test]
    #[traced_test]
    fn destroy_is_logged_once() {
        let pool = ThreadPool::new("logged-pool", 1).unwrap();
        pool.destroy();
        pool.destroy();

        assert!(logs_contain("thread pool destroyed"));
        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|l| l.contains("thread pool destroyed")).count() {
                1 => Ok(()),
                n => Err(format!("expected one destroy log, saw {n}")),
            }
        });
    }
}
