//! Pending-retry queue. Requests whose fabric post came back with "try
//! again" park their context word here; every poll drains the queue
//! front-first before new work is admitted, preserving post order.

use std::collections::VecDeque;
use std::sync::Mutex;

pub struct RetryQueue {
    inner: Mutex<VecDeque<u64>>,
}

impl RetryQueue {
    pub fn new() -> RetryQueue {
        RetryQueue {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    pub fn insert_back(&self, ctx: u64) {
        self.inner.lock().unwrap().push_back(ctx);
    }

    /// Requeue at the front: used when a drained request hits "try again"
    /// once more and must keep its place ahead of younger requests.
    #[inline]
    pub fn insert_front(&self, ctx: u64) {
        self.inner.lock().unwrap().push_front(ctx);
    }

    #[inline]
    pub fn remove_front(&self) -> Option<u64> {
        self.inner.lock().unwrap().pop_front()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = RetryQueue::new();
        queue.insert_back(1);
        queue.insert_back(2);
        queue.insert_back(3);

        assert_eq!(queue.remove_front(), Some(1));
        assert_eq!(queue.remove_front(), Some(2));
        assert_eq!(queue.remove_front(), Some(3));
        assert_eq!(queue.remove_front(), None);
    }

    #[test]
    fn test_front_requeue_keeps_place() {
        let queue = RetryQueue::new();
        queue.insert_back(1);
        queue.insert_back(2);

        let head = queue.remove_front().unwrap();
        queue.insert_front(head);

        assert_eq!(queue.remove_front(), Some(1));
        assert_eq!(queue.remove_front(), Some(2));
    }

    #[test]
    fn test_is_empty() {
        let queue = RetryQueue::new();
        assert!(queue.is_empty());
        queue.insert_back(9);
        assert!(!queue.is_empty());
        queue.remove_front();
        assert!(queue.is_empty());
    }
}
