use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

struct Inner<T> {
    items: VecDeque<T>,
    nonblock: bool,
}

/// Unbounded multi-producer, multi-consumer FIFO.
///
/// Consumers block in [`get`](Self::get) until an item arrives. Once the
/// queue is switched to non-blocking mode, `get` drains what is left and
/// then returns `None`, which is how consumer threads learn to exit.
pub struct MsgQueue<T> {
    inner: Mutex<Inner<T>>,
    condvar: Condvar,
}

impl<T> MsgQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                nonblock: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Appends an item and wakes one consumer.
    pub fn put(&self, item: T) {
        self.inner.lock().items.push_back(item);
        self.condvar.notify_one();
    }

    /// Takes the oldest item, blocking while the queue is empty.
    ///
    /// Returns `None` only in non-blocking mode with an empty queue.
    pub fn get(&self) -> Option<T> {
        let mut inner = self.inner.lock();

        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.nonblock {
                return None;
            }
            self.condvar.wait(&mut inner);
        }
    }

    /// Takes the oldest item without blocking.
    pub fn try_get(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Switches to draining mode and wakes every blocked consumer.
    pub fn set_nonblock(&self) {
        self.inner.lock().nonblock = true;
        self.condvar.notify_all();
    }

    /// Returns to blocking mode.
    pub fn set_block(&self) {
        self.inner.lock().nonblock = false;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }
}

impl<T> Default for MsgQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::MsgQueue;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn items_come_out_in_order() {
        let queue = MsgQueue::new();
        queue.put(1);
        queue.put(2);

        assert_eq!(queue.get(), Some(1));
        assert_eq!(queue.try_get(), Some(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn nonblock_releases_waiting_consumers() {
        let queue = Arc::new(MsgQueue::<u32>::new());

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || queue.get())
            })
            .collect();

        queue.set_nonblock();

        for consumer in consumers {
            assert_eq!(consumer.join().unwrap(), None);
        }
    }

    #[test]
    fn nonblock_still_drains_pending_items() {
        let queue = MsgQueue::new();
        queue.put("a");
        queue.set_nonblock();

        assert_eq!(queue.get(), Some("a"));
        assert_eq!(queue.get(), None);
    }
}
