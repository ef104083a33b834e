use crate::utils::Slab;

use std::collections::BTreeMap;
use std::time::Instant;

/// Handle to an entry of a [`TimeoutQueue`], needed to remove it early.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimeoutKey {
    Tree { deadline: Instant, seq: u64 },
    List(usize),
}

struct ListNode<T> {
    deadline: Instant,
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Deadline bookkeeping of one multiplexer thread.
///
/// Entries whose deadline is not earlier than the current list tail are
/// appended to a FIFO list: keep-alive and response timeouts are uniform,
/// so arrival order is already deadline order and insertion stays O(1).
/// Anything else goes to a deadline-ordered tree. The earliest deadline is
/// the smaller of the list head and the tree minimum.
pub(crate) struct TimeoutQueue<T> {
    tree: BTreeMap<(Instant, u64), T>,
    list: Slab<ListNode<T>>,
    head: Option<usize>,
    tail: Option<usize>,
    seq: u64,
}

impl<T> TimeoutQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            tree: BTreeMap::new(),
            list: Slab::new(64),
            head: None,
            tail: None,
            seq: 0,
        }
    }

    pub(crate) fn insert(&mut self, deadline: Instant, value: T) -> TimeoutKey {
        let append = match self.tail.and_then(|tail| self.list.get(tail)) {
            Some(tail) => deadline >= tail.deadline,
            None => true,
        };

        if append {
            let index = self.list.insert(ListNode {
                deadline,
                value,
                prev: self.tail,
                next: None,
            });

            match self.tail.and_then(|tail| self.list.get_mut(tail)) {
                Some(tail) => tail.next = Some(index),
                None => self.head = Some(index),
            }
            self.tail = Some(index);

            return TimeoutKey::List(index);
        }

        self.seq += 1;
        self.tree.insert((deadline, self.seq), value);

        TimeoutKey::Tree {
            deadline,
            seq: self.seq,
        }
    }

    pub(crate) fn remove(&mut self, key: TimeoutKey) -> Option<T> {
        match key {
            TimeoutKey::Tree { deadline, seq } => self.tree.remove(&(deadline, seq)),
            TimeoutKey::List(index) => self.unlink(index).map(|(_, value)| value),
        }
    }

    /// Earliest pending deadline.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let list = self
            .head
            .and_then(|head| self.list.get(head))
            .map(|node| node.deadline);
        let tree = self.tree.keys().next().map(|(deadline, _)| *deadline);

        match (list, tree) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Removes and returns the earliest entry if its deadline is `<= now`.
    ///
    /// Repeated calls yield expired entries in non-decreasing deadline order.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<(Instant, T)> {
        let deadline = self.next_deadline().filter(|deadline| *deadline <= now)?;

        let from_list = self
            .head
            .and_then(|head| self.list.get(head))
            .is_some_and(|node| node.deadline == deadline);

        if from_list {
            let head = self.head?;
            return self.unlink(head);
        }

        self.tree
            .pop_first()
            .map(|((deadline, _), value)| (deadline, value))
    }

    /// Removes every entry, earliest first.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());

        while let Some(deadline) = self.next_deadline() {
            match self.pop_expired(deadline) {
                Some((_, value)) => out.push(value),
                None => break,
            }
        }

        out
    }

    pub(crate) fn len(&self) -> usize {
        self.tree.len() + self.list.len()
    }

    fn unlink(&mut self, index: usize) -> Option<(Instant, T)> {
        let node = self.list.remove(index)?;

        match node.prev.and_then(|prev| self.list.get_mut(prev)) {
            Some(prev) => prev.next = node.next,
            None => self.head = node.next,
        }
        match node.next.and_then(|next| self.list.get_mut(next)) {
            Some(next) => next.prev = node.prev,
            None => self.tail = node.prev,
        }

        Some((node.deadline, node.value))
    }
}
