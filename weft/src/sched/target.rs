use super::group::GroupShared;
use super::object::{RequestObject, wait_for_slot};
use crate::comm::{CommTarget, Release};
use crate::{Error, Result};

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A [`CommTarget`] with a cap on concurrent exchanges.
///
/// Every successful [`acquire`](RequestObject::acquire) takes one load slot;
/// the communicator gives it back when the exchange ends. Callers asking
/// for a slot while the target is saturated wait according to their
/// timeout.
///
/// A target may join one [`SchedGroup`](super::SchedGroup). While it is a
/// member its load counters are guarded by the group's lock instead of its
/// own, so group and target views never disagree.
pub struct SchedTarget {
    comm: Arc<CommTarget>,
    max_load: usize,

    // Guarded by `group` while standalone, by the group's state once joined.
    pub(super) cur_load: AtomicUsize,
    pub(super) waiting: AtomicUsize,
    pub(super) index: AtomicUsize,

    /// The target's own lock; holds its group membership.
    pub(super) group: Mutex<Option<Weak<GroupShared>>>,
    pub(super) cond: Condvar,
}

impl SchedTarget {
    /// Wraps `target`, allowing at most `max_load` concurrent exchanges.
    ///
    /// # Errors
    ///
    /// Returns `EINVAL` if `max_load` is zero.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let target = SchedTarget::new(CommTarget::new(addr), 8)?;
    /// let sent_to = scheduler.request(session, &*target, None)?;
    /// ```
    pub fn new(target: CommTarget, max_load: usize) -> Result<Arc<Self>> {
        if max_load == 0 {
            return Err(Error::from_errno(libc::EINVAL));
        }

        Ok(Arc::new_cyclic(|this: &Weak<SchedTarget>| {
            let releaser: Weak<dyn Release> = this.clone();

            Self {
                comm: Arc::new(target.with_releaser(releaser)),
                max_load,
                cur_load: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                index: AtomicUsize::new(0),
                group: Mutex::new(None),
                cond: Condvar::new(),
            }
        }))
    }

    /// The connection target handed to the communicator.
    pub fn target(&self) -> &Arc<CommTarget> {
        &self.comm
    }

    pub(super) fn load(&self) -> usize {
        self.cur_load.load(Ordering::Relaxed)
    }

    pub(super) fn is_full(&self) -> bool {
        self.load() >= self.max_load
    }

    pub(super) fn waiters(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }
}

impl RequestObject for SchedTarget {
    fn acquire(&self, wait_timeout: Option<Duration>) -> Result<Arc<CommTarget>> {
        let mut own = self.group.lock();
        let group = own.as_ref().and_then(Weak::upgrade);

        match group {
            Some(group) => {
                let mut state = group.state.lock();
                drop(own);

                wait_for_slot(
                    &self.cond,
                    &mut state,
                    wait_timeout,
                    |_| self.is_full(),
                    |_| {
                        self.waiting.fetch_add(1, Ordering::Relaxed);
                    },
                    |_| {
                        self.waiting.fetch_sub(1, Ordering::Relaxed);
                    },
                )?;

                self.cur_load.fetch_add(1, Ordering::Relaxed);
                state.cur_load += 1;
                state.heapify(self.index.load(Ordering::Relaxed));
            }
            None => {
                wait_for_slot(
                    &self.cond,
                    &mut own,
                    wait_timeout,
                    |_| self.is_full(),
                    |_| {
                        self.waiting.fetch_add(1, Ordering::Relaxed);
                    },
                    |_| {
                        self.waiting.fetch_sub(1, Ordering::Relaxed);
                    },
                )?;

                self.cur_load.fetch_add(1, Ordering::Relaxed);
            }
        }

        Ok(self.comm.clone())
    }

    fn max_load(&self) -> usize {
        self.max_load
    }

    fn cur_load(&self) -> usize {
        self.load()
    }
}

impl Release for SchedTarget {
    fn release(&self, keep_alive: bool) {
        let own = self.group.lock();
        let group = own.as_ref().and_then(Weak::upgrade);

        match group {
            Some(group) => {
                let mut state = group.state.lock();
                drop(own);

                self.cur_load.fetch_sub(1, Ordering::Relaxed);
                state.cur_load -= 1;

                if self.waiters() > 0 {
                    self.cond.notify_one();
                } else if state.waiting > 0 {
                    group.cond.notify_one();
                }

                state.heap_adjust(self.index.load(Ordering::Relaxed), keep_alive);
            }
            None => {
                self.cur_load.fetch_sub(1, Ordering::Relaxed);
                if self.waiters() > 0 {
                    self.cond.notify_one();
                }
            }
        }
    }
}

impl std::fmt::Debug for SchedTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedTarget")
            .field("addr", &self.comm.addr())
            .field("max_load", &self.max_load)
            .field("cur_load", &self.load())
            .finish()
    }
}
