//! Fixed-capacity FIFO of pending requests.

use std::collections::VecDeque;

use crate::error::{CameraError, Result};

/// FIFO that refuses to grow past its capacity.
///
/// `push` on a full queue and `pop` on an empty one are errors rather than
/// silent drops, so callers can tell the two conditions apart.
#[derive(Debug, Clone)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create an empty queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum number of items.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether another `push` would overflow.
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Append to the back.
    pub fn push(&mut self, item: T) -> Result<()> {
        if self.is_full() {
            return Err(CameraError::QueueOverflow {
                capacity: self.capacity,
            });
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Remove from the front.
    pub fn pop(&mut self) -> Result<T> {
        self.items.pop_front().ok_or(CameraError::QueueEmpty)
    }

    /// Oldest pending item.
    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    /// Drop everything pending. Returns how many items were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.items.len();
        self.items.clear();
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_two() {
        let mut queue = BoundedQueue::new(2);
        queue.push('a').expect("first push should succeed");
        queue.push('b').expect("second push should succeed");
        assert!(matches!(
            queue.push('c'),
            Err(CameraError::QueueOverflow { capacity: 2 })
        ));
        assert_eq!(queue.pop().expect("pop should succeed"), 'a');
        assert_eq!(queue.pop().expect("pop should succeed"), 'b');
        assert!(matches!(queue.pop(), Err(CameraError::QueueEmpty)));
    }

    #[test]
    fn test_overflow_keeps_contents() {
        let mut queue = BoundedQueue::new(1);
        queue.push(1).expect("push should succeed");
        assert!(queue.push(2).is_err());
        assert_eq!(queue.front(), Some(&1));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_clear_reports_discarded() {
        let mut queue = BoundedQueue::new(4);
        for item in 0..3 {
            queue.push(item).expect("push should succeed");
        }
        assert_eq!(queue.clear(), 3);
        assert!(queue.is_empty());
        assert!(!queue.is_full());
    }
}
