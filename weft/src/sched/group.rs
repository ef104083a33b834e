use super::object::{RequestObject, wait_for_slot};
use super::target::SchedTarget;
use crate::comm::CommTarget;
use crate::{Error, Result};

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

pub(crate) struct GroupShared {
    pub(super) state: Mutex<GroupState>,
    pub(super) cond: Condvar,
}

/// Member heap ordered by relative load, least loaded at the root.
pub(crate) struct GroupState {
    heap: Vec<Arc<SchedTarget>>,
    pub(super) max_load: usize,
    pub(super) cur_load: usize,
    pub(super) waiting: usize,
}

/// Orders two targets by `cur / max` without dividing.
fn target_cmp(a: &SchedTarget, b: &SchedTarget) -> CmpOrdering {
    let left = a.load() as u128 * b.max_load() as u128;
    let right = b.load() as u128 * a.max_load() as u128;
    left.cmp(&right)
}

impl GroupState {
    fn place(&mut self, index: usize, target: Arc<SchedTarget>) {
        target.index.store(index, Ordering::Relaxed);
        self.heap[index] = target;
    }

    /// Moves the target at `index` towards the root while it is lighter
    /// than its parent. With `swap_on_equal` it also passes equally
    /// loaded parents.
    pub(super) fn heap_adjust(&mut self, mut index: usize, swap_on_equal: bool) {
        let target = self.heap[index].clone();

        while index > 0 {
            let parent = (index - 1) / 2;
            let order = target_cmp(&target, &self.heap[parent]);
            let rises = order == CmpOrdering::Less || (swap_on_equal && order == CmpOrdering::Equal);
            if !rises {
                break;
            }

            let moved = self.heap[parent].clone();
            self.place(index, moved);
            index = parent;
        }

        self.place(index, target);
    }

    /// Moves the target at `top` towards the leaves while a child is
    /// lighter.
    pub(super) fn heapify(&mut self, mut top: usize) {
        let target = self.heap[top].clone();
        let len = self.heap.len();

        loop {
            let left = 2 * top + 1;
            if left >= len {
                break;
            }

            let right = left + 1;
            let lighter = if right < len
                && target_cmp(&self.heap[right], &self.heap[left]) == CmpOrdering::Less
            {
                right
            } else {
                left
            };

            if target_cmp(&self.heap[lighter], &target) != CmpOrdering::Less {
                break;
            }

            let moved = self.heap[lighter].clone();
            self.place(top, moved);
            top = lighter;
        }

        self.place(top, target);
    }

    fn insert(&mut self, target: Arc<SchedTarget>) {
        let index = self.heap.len();
        target.index.store(index, Ordering::Relaxed);
        self.heap.push(target);
        self.heap_adjust(index, false);
    }

    fn remove(&mut self, index: usize) {
        let Some(last) = self.heap.pop() else {
            return;
        };

        if index < self.heap.len() {
            let moved = last.clone();
            self.place(index, last);
            self.heap_adjust(index, false);
            self.heapify(moved.index.load(Ordering::Relaxed));
        }
    }
}

/// A set of [`SchedTarget`]s behind one acquire/release pair.
///
/// Acquiring from the group takes a slot on the member with the lowest
/// `cur_load / max_load`. The group saturates only when every member does.
/// Members keep working when acquired directly; their load is shared with
/// the group either way.
pub struct SchedGroup {
    shared: Arc<GroupShared>,
}

impl SchedGroup {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(GroupShared {
                state: Mutex::new(GroupState {
                    heap: Vec::with_capacity(4),
                    max_load: 0,
                    cur_load: 0,
                    waiting: 0,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Adds `target` to the group.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyInGroup`] if it is a member already.
    /// - [`Error::InOtherGroup`] if another group owns it.
    /// - [`Error::Busy`] if callers are waiting on it.
    pub fn add(&self, target: &Arc<SchedTarget>) -> Result<()> {
        let mut own = target.group.lock();
        let mut state = self.shared.state.lock();

        if let Some(current) = own.as_ref().and_then(Weak::upgrade) {
            return Err(if Arc::ptr_eq(&current, &self.shared) {
                Error::AlreadyInGroup
            } else {
                Error::InOtherGroup
            });
        }

        if target.waiters() > 0 {
            return Err(Error::Busy);
        }

        state.insert(target.clone());
        state.max_load += target.max_load();
        state.cur_load += target.load();
        *own = Some(Arc::downgrade(&self.shared));

        if state.waiting > 0 && state.cur_load < state.max_load {
            self.shared.cond.notify_one();
        }

        Ok(())
    }

    /// Removes `target` from the group.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInGroup`] if it is not a member.
    /// - [`Error::Busy`] if callers are waiting on it.
    pub fn remove(&self, target: &Arc<SchedTarget>) -> Result<()> {
        let mut own = target.group.lock();
        let mut state = self.shared.state.lock();

        let member = own
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|g| Arc::ptr_eq(&g, &self.shared));

        if !member {
            return Err(Error::NotInGroup);
        }

        if target.waiters() > 0 {
            return Err(Error::Busy);
        }

        state.remove(target.index.load(Ordering::Relaxed));
        state.max_load -= target.max_load();
        state.cur_load -= target.load();
        *own = None;

        Ok(())
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SchedGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestObject for SchedGroup {
    fn acquire(&self, wait_timeout: Option<Duration>) -> Result<Arc<CommTarget>> {
        let mut state = self.shared.state.lock();

        wait_for_slot(
            &self.shared.cond,
            &mut state,
            wait_timeout,
            |s| s.cur_load >= s.max_load,
            |s| s.waiting += 1,
            |s| s.waiting -= 1,
        )?;

        let Some(target) = state.heap.first().cloned() else {
            return Err(Error::WouldBlock);
        };

        target.cur_load.fetch_add(1, Ordering::Relaxed);
        state.cur_load += 1;
        state.heapify(0);

        Ok(target.target().clone())
    }

    fn max_load(&self) -> usize {
        self.shared.state.lock().max_load
    }

    fn cur_load(&self) -> usize {
        self.shared.state.lock().cur_load
    }
}

impl std::fmt::Debug for SchedGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("SchedGroup")
            .field("members", &state.heap.len())
            .field("max_load", &state.max_load)
            .field("cur_load", &state.cur_load)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn target(port: u16, max_load: usize) -> Arc<SchedTarget> {
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
        SchedTarget::new(CommTarget::new(addr), max_load).unwrap()
    }

    fn heap_is_ordered(group: &SchedGroup) -> bool {
        let state = group.shared.state.lock();
        (1..state.heap.len()).all(|i| {
            let parent = (i - 1) / 2;
            target_cmp(&state.heap[parent], &state.heap[i]) != CmpOrdering::Greater
                && state.heap[i].index.load(Ordering::Relaxed) == i
        })
    }

    #[test]
    fn membership_errors() {
        let group = SchedGroup::new();
        let other = SchedGroup::new();
        let t = target(1, 2);

        group.add(&t).unwrap();
        assert!(matches!(group.add(&t), Err(Error::AlreadyInGroup)));
        assert!(matches!(other.add(&t), Err(Error::InOtherGroup)));
        assert!(matches!(other.remove(&t), Err(Error::NotInGroup)));

        group.remove(&t).unwrap();
        assert!(group.is_empty());
        assert_eq!(group.max_load(), 0);
    }

    #[test]
    fn empty_group_is_saturated() {
        let group = SchedGroup::new();
        assert!(matches!(
            group.acquire(Some(Duration::ZERO)),
            Err(Error::WouldBlock)
        ));
    }

    #[test]
    fn acquire_prefers_relatively_idle_members() {
        let group = SchedGroup::new();
        let small = target(1, 1);
        let large = target(2, 4);
        group.add(&small).unwrap();
        group.add(&large).unwrap();

        let mut picks = Vec::new();
        for _ in 0..5 {
            picks.push(group.acquire(Some(Duration::ZERO)).unwrap().addr().port());
        }

        assert_eq!(picks.iter().filter(|&&p| p == 1).count(), 1);
        assert_eq!(picks.iter().filter(|&&p| p == 2).count(), 4);
        assert!(group.acquire(Some(Duration::ZERO)).is_err());
        assert!(heap_is_ordered(&group));
    }

    #[test]
    fn direct_acquire_counts_against_the_group() {
        let group = SchedGroup::new();
        let t = target(1, 1);
        group.add(&t).unwrap();

        t.acquire(None).unwrap();
        assert_eq!(group.cur_load(), 1);
        assert!(matches!(
            group.acquire(Some(Duration::ZERO)),
            Err(Error::WouldBlock)
        ));

        t.target().release(false);
        assert_eq!(group.cur_load(), 0);
    }

    #[test]
    fn keep_alive_release_wins_ties() {
        let group = SchedGroup::new();
        let a = target(1, 2);
        let b = target(2, 2);
        group.add(&a).unwrap();
        group.add(&b).unwrap();

        let first = group.acquire(None).unwrap();
        let second = group.acquire(None).unwrap();
        assert_ne!(first.addr(), second.addr());

        second.release(false);
        first.release(true);

        let next = group.acquire(None).unwrap();
        assert_eq!(next.addr(), first.addr());
    }

    proptest! {
        #[test]
        fn acquires_fill_equal_members_evenly(members in 1usize..8, acquires in 0usize..64) {
            let group = SchedGroup::new();
            let targets: Vec<_> = (0..members).map(|i| target(i as u16 + 1, 64)).collect();
            for t in &targets {
                group.add(t).unwrap();
            }

            for _ in 0..acquires {
                group.acquire(Some(Duration::ZERO)).unwrap();

                let loads: Vec<_> = targets.iter().map(|t| t.cur_load()).collect();
                let spread = loads.iter().max().unwrap() - loads.iter().min().unwrap();
                prop_assert!(spread <= 1);
            }
        }

        #[test]
        fn interleaved_ops_keep_the_heap_consistent(
            members in 1usize..8,
            ops in prop::collection::vec(any::<bool>(), 1..200),
        ) {
            let group = SchedGroup::new();
            let targets: Vec<_> = (0..members).map(|i| target(i as u16 + 1, 1000)).collect();
            for t in &targets {
                group.add(t).unwrap();
            }

            let mut held: Vec<Arc<CommTarget>> = Vec::new();
            for acquire in ops {
                if acquire || held.is_empty() {
                    held.push(group.acquire(Some(Duration::ZERO)).unwrap());
                } else {
                    held.remove(0).release(false);
                }

                prop_assert!(heap_is_ordered(&group));
                let total: usize = targets.iter().map(|t| t.cur_load()).sum();
                prop_assert_eq!(total, held.len());
                prop_assert_eq!(group.cur_load(), held.len());
            }
        }

        #[test]
        fn sequential_cycles_never_skew(members in 1usize..8, cycles in 1usize..100) {
            let group = SchedGroup::new();
            let targets: Vec<_> = (0..members).map(|i| target(i as u16 + 1, 16)).collect();
            for t in &targets {
                group.add(t).unwrap();
            }

            for _ in 0..cycles {
                let comm = group.acquire(Some(Duration::ZERO)).unwrap();
                comm.release(false);
            }

            prop_assert!(targets.iter().all(|t| t.cur_load() == 0));
            prop_assert_eq!(group.cur_load(), 0);
            prop_assert!(heap_is_ordered(&group));
        }
    }
}
