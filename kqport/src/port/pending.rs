use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// Bounded blocking queue shared by the port's worker threads.
///
/// Workers block in [`take`](Self::take) until an item is available.
/// Producers block in [`put`](Self::put) while the queue is full, which
/// can only last until some other worker takes an item.
pub(crate) struct PendingQueue<T> {
    /// Items waiting for a worker.
    items: Mutex<VecDeque<T>>,

    /// Signalled when an item is pushed.
    not_empty: Condvar,

    /// Signalled when an item is taken.
    not_full: Condvar,

    capacity: usize,
}

impl<T> PendingQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);

        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Appends an item, waiting for room if the queue is full.
    pub(crate) fn put(&self, item: T) {
        let mut items = self.items.lock();

        while items.len() >= self.capacity {
            self.not_full.wait(&mut items);
        }

        items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Removes the oldest item, waiting until one is available.
    pub(crate) fn take(&self) -> T {
        let mut items = self.items.lock();

        loop {
            if let Some(item) = items.pop_front() {
                self.not_full.notify_one();
                return item;
            }

            self.not_empty.wait(&mut items);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }
}
