use crate::comm::CommTarget;
use crate::{Error, Result};

use parking_lot::{Condvar, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Something a connection target can be drawn from: a single
/// [`SchedTarget`](super::SchedTarget) or a [`SchedGroup`](super::SchedGroup).
pub trait RequestObject: Send + Sync {
    /// Takes one load slot and returns the target it belongs to.
    ///
    /// # Arguments
    ///
    /// * `wait_timeout` - How long to wait while saturated. `None` waits
    ///   forever, zero does not wait at all.
    ///
    /// # Errors
    ///
    /// [`Error::WouldBlock`] when saturated and `wait_timeout` is zero,
    /// [`Error::TimedOut`] when the wait expired.
    fn acquire(&self, wait_timeout: Option<Duration>) -> Result<Arc<CommTarget>>;

    fn max_load(&self) -> usize;

    fn cur_load(&self) -> usize;
}

/// Blocks on `cond` while `full` holds, bounded by `timeout`.
///
/// `enter` and `leave` bracket every wait so releasers know someone is
/// parked.
pub(super) fn wait_for_slot<T>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    timeout: Option<Duration>,
    full: impl Fn(&T) -> bool,
    enter: impl Fn(&mut T),
    leave: impl Fn(&mut T),
) -> Result<()> {
    if !full(&**guard) {
        return Ok(());
    }

    if timeout == Some(Duration::ZERO) {
        return Err(Error::WouldBlock);
    }

    let deadline = timeout.map(|t| Instant::now() + t);

    while full(&**guard) {
        enter(&mut **guard);
        let timed_out = match deadline {
            Some(deadline) => cond.wait_until(guard, deadline).timed_out(),
            None => {
                cond.wait(guard);
                false
            }
        };
        leave(&mut **guard);

        if timed_out && full(&**guard) {
            return Err(Error::TimedOut);
        }
    }

    Ok(())
}
