use std::fmt;
use std::time::Instant;

use taskpool_api::errors::QueueError;
use taskpool_api::task::{DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY};

/// Default capacity of the fixed queues and of the priority queue buckets.
pub const DEFAULT_QUEUE_SIZE: usize = 2048;

/// An element stored in a fixed queue.
#[derive(Debug, Clone)]
pub struct FixedQueueNode<T> {
    pub data: T,
    pub priority: i32,
    /// Monotonic insertion time, drives aging
    pub timestamp: Instant,
}

impl<T> FixedQueueNode<T> {
    /// `priority` is clamped to [`MIN_PRIORITY`, `MAX_PRIORITY`].
    pub(crate) fn new(data: T, priority: i32) -> Self {
        Self {
            data,
            priority: priority.clamp(MIN_PRIORITY, MAX_PRIORITY),
            timestamp: Instant::now(),
        }
    }
}

/// Preallocated ring storage shared by [`FixedQueue`] and the priority-ordered variant.
///
/// `start` is the physical slot of the logical head and `size` the occupancy.
/// Logical index `i` lives at physical slot `(start + i) mod capacity`.
pub(crate) struct Ring<T> {
    slots: Box<[Option<FixedQueueNode<T>>]>,
    start: usize,
    size: usize,
}

impl<T> Ring<T> {
    /// Callers validate `capacity > 0`.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        let slots = (0..capacity).map(|_| None).collect::<Vec<_>>().into_boxed_slice();
        Self {
            slots,
            start: 0,
            size: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.size
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.size == self.capacity()
    }

    fn physical(&self, logical: usize) -> usize {
        let index = self.start + logical;
        if index >= self.capacity() {
            index - self.capacity()
        } else {
            index
        }
    }

    pub(crate) fn push_back(&mut self, node: FixedQueueNode<T>) {
        debug_assert!(!self.is_full());
        let end = self.physical(self.size);
        self.slots[end] = Some(node);
        self.size += 1;
    }

    pub(crate) fn pop_front(&mut self) -> Option<FixedQueueNode<T>> {
        if self.is_empty() {
            return None;
        }
        let node = self.slots[self.start].take();
        self.start = self.physical(1);
        self.size -= 1;
        node
    }

    pub(crate) fn get(&self, logical: usize) -> Option<&FixedQueueNode<T>> {
        if logical >= self.size {
            return None;
        }
        self.slots[self.physical(logical)].as_ref()
    }

    /// Inserts `node` at `logical`, shifting the tail of the queue right by one slot.
    pub(crate) fn insert(&mut self, logical: usize, node: FixedQueueNode<T>) {
        debug_assert!(logical <= self.size && !self.is_full());
        let mut current = self.size;
        while current > logical {
            let to = self.physical(current);
            let from = self.physical(current - 1);
            self.slots[to] = self.slots[from].take();
            current -= 1;
        }
        let at = self.physical(logical);
        self.slots[at] = Some(node);
        self.size += 1;
    }

    /// Removes the node at `logical`, shifting later nodes left by one slot.
    pub(crate) fn remove(&mut self, logical: usize) -> Option<FixedQueueNode<T>> {
        if logical >= self.size {
            return None;
        }
        let removed = self.slots[self.physical(logical)].take();
        for index in logical..self.size - 1 {
            let to = self.physical(index);
            let from = self.physical(index + 1);
            self.slots[to] = self.slots[from].take();
        }
        self.size -= 1;
        removed
    }

    pub(crate) fn position<P>(&self, mut predicate: P) -> Option<usize>
    where
        P: FnMut(&FixedQueueNode<T>) -> bool,
    {
        (0..self.size).find(|&index| self.get(index).is_some_and(&mut predicate))
    }

    pub(crate) fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.start = 0;
        self.size = 0;
    }

    pub(crate) fn iter(&self) -> Iter<'_, T> {
        Iter {
            ring: self,
            index: 0,
        }
    }
}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity())
            .field("start", &self.start)
            .field("size", &self.size)
            .finish()
    }
}

/// Iterator over queued data, oldest first.
pub struct Iter<'a, T> {
    ring: &'a Ring<T>,
    index: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.ring.get(self.index)?;
        self.index += 1;
        Some(&node.data)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.ring.len().saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

/// Bounded FIFO ring queue.
///
/// The capacity is fixed at construction. `enqueue` on a full queue fails with
/// [`QueueError::Full`], check [`FixedQueue::is_full`] first to avoid it.
#[derive(Debug)]
pub struct FixedQueue<T> {
    ring: Ring<T>,
}

impl<T> FixedQueue<T> {
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::InvalidCapacity(capacity));
        }
        Ok(Self::with_capacity(capacity))
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: Ring::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    /// Appends `data` and returns the new size.
    pub fn enqueue(&mut self, data: T, priority: Option<i32>) -> Result<usize, QueueError> {
        if self.is_full() {
            return Err(QueueError::Full {
                capacity: self.capacity(),
            });
        }
        self.push(data, priority.unwrap_or(DEFAULT_PRIORITY));
        Ok(self.len())
    }

    pub(crate) fn push(&mut self, data: T, priority: i32) {
        self.ring.push_back(FixedQueueNode::new(data, priority));
    }

    pub fn dequeue(&mut self) -> Option<T> {
        self.ring.pop_front().map(|node| node.data)
    }

    pub(crate) fn dequeue_node(&mut self) -> Option<FixedQueueNode<T>> {
        self.ring.pop_front()
    }

    /// Returns the element at logical `index`, 0 being the oldest.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.ring.get(index).map(|node| &node.data)
    }

    /// Removes the first element equal to `data`.
    pub fn delete(&mut self, data: &T) -> bool
    where
        T: PartialEq,
    {
        match self.ring.position(|node| node.data == *data) {
            Some(index) => self.ring.remove(index).is_some(),
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.ring.clear();
    }

    pub fn iter(&self) -> Iter<'_, T> {
        self.ring.iter()
    }
}

impl<'a, T> IntoIterator for &'a FixedQueue<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert_eq!(
            FixedQueue::<u32>::new(0).unwrap_err(),
            QueueError::InvalidCapacity(0)
        );
    }

    #[test]
    fn test_fifo_order_and_size_bound() {
        let mut queue = FixedQueue::new(3).unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.enqueue(1, None).unwrap(), 1);
        assert_eq!(queue.enqueue(2, None).unwrap(), 2);
        assert_eq!(queue.enqueue(3, Some(-3)).unwrap(), 3);
        assert!(queue.is_full());
        assert_eq!(queue.enqueue(4, None), Err(QueueError::Full { capacity: 3 }));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.dequeue(), Some(1));
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), Some(3));
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wraps_around_physical_end() {
        let mut queue = FixedQueue::new(3).unwrap();
        for round in 0..10 {
            queue.enqueue(round, None).unwrap();
            queue.enqueue(round + 100, None).unwrap();
            assert_eq!(queue.dequeue(), Some(round));
            assert_eq!(queue.dequeue(), Some(round + 100));
        }
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_get_uses_logical_index() {
        let mut queue = FixedQueue::new(4).unwrap();
        for value in 0..4 {
            queue.enqueue(value, None).unwrap();
        }
        queue.dequeue();
        queue.dequeue();
        queue.enqueue(4, None).unwrap();
        assert_eq!(queue.get(0), Some(&2));
        assert_eq!(queue.get(2), Some(&4));
        assert_eq!(queue.get(3), None);
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn test_delete_closes_the_gap() {
        let mut queue = FixedQueue::new(4).unwrap();
        queue.enqueue(7, None).unwrap();
        queue.dequeue();
        for value in [1, 2, 3, 4] {
            queue.enqueue(value, None).unwrap();
        }
        assert!(queue.delete(&2));
        assert!(!queue.delete(&42));
        assert_eq!(queue.len(), 3);
        assert_eq!((&queue).into_iter().copied().collect::<Vec<_>>(), vec![1, 3, 4]);
        queue.enqueue(5, None).unwrap();
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![1, 3, 4, 5]);
    }

    #[test]
    fn test_clear() {
        let mut queue = FixedQueue::new(2).unwrap();
        queue.enqueue("a", None).unwrap();
        queue.enqueue("b", None).unwrap();
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.get(0), None);
        assert_eq!(queue.enqueue("c", None).unwrap(), 1);
    }
}
