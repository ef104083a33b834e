use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Identifier of the thread pool the current thread belongs to.
    ///
    /// Set once when a pool thread starts, so code running on it can ask
    /// whether it is already inside a given pool without any lookup.
    static CURRENT_POOL: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Allocates a process-unique pool identifier.
pub(crate) fn next_pool_id() -> usize {
    NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Runs `f` with the current thread marked as a member of pool `id`.
///
/// The previous marker is restored afterwards.
///
/// # Arguments
///
/// * `id` - Identifier returned by [`next_pool_id`].
/// * `f` - The thread's main routine.
pub(crate) fn enter_pool<R>(id: usize, f: impl FnOnce() -> R) -> R {
    let prev = CURRENT_POOL.with(|c| c.replace(Some(id)));
    let out = f();
    CURRENT_POOL.with(|c| c.set(prev));

    out
}

/// Returns the pool the current thread runs in, if any.
pub(crate) fn current_pool() -> Option<usize> {
    CURRENT_POOL.with(Cell::get)
}
