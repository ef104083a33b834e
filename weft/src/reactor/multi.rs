use super::core::Poll;
use super::node::{PollData, PollHandler};
use crate::error::Result;

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A fixed set of [`Poll`] loops behind one handle.
///
/// Descriptors are routed to loop `fd % n`, so every operation on one
/// descriptor always reaches the same loop. Timers have no descriptor and
/// are spread round-robin.
pub struct MultiPoll<C> {
    polls: Arc<[Poll<C>]>,
    next_timer: Arc<AtomicUsize>,
}

impl<C> Clone for MultiPoll<C> {
    fn clone(&self) -> Self {
        Self {
            polls: self.polls.clone(),
            next_timer: self.next_timer.clone(),
        }
    }
}

impl<C: Clone + Send + 'static> MultiPoll<C> {
    /// Creates `threads` stopped loops sharing one handler.
    pub fn new(
        threads: usize,
        max_open_files: usize,
        handler: Arc<dyn PollHandler<C>>,
    ) -> Result<Self> {
        let polls = (0..threads.max(1))
            .map(|id| Poll::new(id, max_open_files, handler.clone()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            polls: polls.into(),
            next_timer: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Starts every loop; on failure the ones already started are stopped.
    pub fn start(&self) -> Result<()> {
        for (i, poll) in self.polls.iter().enumerate() {
            if let Err(e) = poll.start() {
                for started in &self.polls[..i] {
                    started.stop();
                }
                return Err(e);
            }
        }

        Ok(())
    }

    pub fn stop(&self) {
        for poll in self.polls.iter() {
            poll.stop();
        }
    }

    pub fn threads(&self) -> usize {
        self.polls.len()
    }

    fn route(&self, fd: RawFd) -> &Poll<C> {
        &self.polls[fd.unsigned_abs() as usize % self.polls.len()]
    }

    pub fn add(&self, data: PollData<C>, timeout: Option<Duration>) -> Result<()> {
        self.route(data.fd).add(data, timeout)
    }

    pub fn modify(&self, data: PollData<C>, timeout: Option<Duration>) -> Result<()> {
        self.route(data.fd).modify(data, timeout)
    }

    pub fn delete(&self, fd: RawFd) -> bool {
        self.route(fd).delete(fd)
    }

    pub fn set_timeout(&self, fd: RawFd, timeout: Option<Duration>) -> Result<()> {
        self.route(fd).set_timeout(fd, timeout)
    }

    pub fn add_timer(&self, after: Duration, context: C) -> Result<()> {
        let index = self.next_timer.fetch_add(1, Ordering::Relaxed) % self.polls.len();
        self.polls[index].add_timer(after, context)
    }
}
