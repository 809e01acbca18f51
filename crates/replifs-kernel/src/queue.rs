//! Fixed-capacity FIFO used to batch deferred heals.
//!
//! Capacity is set at construction and never grows: once every slot is in
//! use, adds fail and hand the item back. Removal never blocks.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Slots allocated when a queue is created with capacity 0.
pub const DEFAULT_CAPACITY: usize = 32;

/// Bounded, non-blocking queue.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    used: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// A queue with `capacity` slots (0 selects [`DEFAULT_CAPACITY`]).
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity
        };
        Self {
            used: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Take a free slot for `item`, at the head or the tail.
    ///
    /// Returns the item when no slot is free.
    pub fn add(&self, item: T, head: bool) -> Result<(), T> {
        let mut used = self.used.lock();
        if used.len() >= self.capacity {
            return Err(item);
        }
        if head {
            used.push_front(item);
        } else {
            used.push_back(item);
        }
        Ok(())
    }

    pub fn push(&self, item: T) -> Result<(), T> {
        self.add(item, false)
    }

    /// Remove the head item, or `None` when the queue is empty.
    pub fn remove(&self) -> Option<T> {
        self.used.lock().pop_front()
    }

    /// Release every slot, returning the items in queue order.
    pub fn remove_all(&self) -> Vec<T> {
        self.used.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.used.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots still available.
    pub fn free(&self) -> usize {
        self.capacity - self.len()
    }
}

impl<T: PartialEq> BoundedQueue<T> {
    /// Remove the first item equal to `item`. Returns whether one was found.
    pub fn remove_data(&self, item: &T) -> bool {
        let mut used = self.used.lock();
        match used.iter().position(|queued| queued == item) {
            Some(pos) => {
                used.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.used.lock().contains(item)
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        let left = self.used.get_mut().len();
        if left > 0 {
            tracing::warn!(left, "dropping non-empty queue");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_zero_selects_default() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(0);
        assert_eq!(queue.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn test_remove_on_empty_returns_none() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(4);
        assert_eq!(queue.remove(), None);
    }

    #[test]
    fn test_capacity_bounds_adds() {
        let queue = BoundedQueue::new(2);
        assert!(queue.push(1).is_ok());
        assert!(queue.push(2).is_ok());
        assert_eq!(queue.push(3), Err(3));
        assert_eq!(queue.free(), 0);

        assert_eq!(queue.remove(), Some(1));
        assert!(queue.push(3).is_ok());
        assert_eq!(queue.remove_all(), vec![2, 3]);
    }

    #[test]
    fn test_head_insert_and_remove_data() {
        let queue = BoundedQueue::new(8);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.add(0, true).unwrap();

        assert!(queue.remove_data(&1));
        assert!(!queue.remove_data(&7));
        assert_eq!(queue.remove_all(), vec![0, 2]);
    }

    #[test]
    fn test_concurrent_adds_never_exceed_capacity() {
        let queue = Arc::new(BoundedQueue::new(5));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let queue = queue.clone();
                std::thread::spawn(move || queue.push(i).is_ok())
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(accepted, 5);
        assert_eq!(queue.len(), 5);
        queue.remove_all();
    }
}
