use std::time::Instant;

use taskpool_api::errors::{ConfigError, QueueError};
use taskpool_api::task::DEFAULT_PRIORITY;

use super::fixed::{FixedQueueNode, Iter, Ring};

/// Default priority decrease per millisecond waited.
pub const DEFAULT_AGING_FACTOR: f64 = 0.001;

/// Default exponent applied to the queue load when scaling the aging factor.
pub const DEFAULT_LOAD_EXPONENT: f64 = 1.0 / 1.5;

/// Bounded ring queue ordered by effective priority.
///
/// A node's effective priority is its stored priority minus the time it has
/// waited (in milliseconds) times an aging factor that grows with the queue
/// load:
///
/// ```text
/// effective_aging_factor = aging_factor * (1 + ((size + 1) / capacity) ^ load_exponent)
/// effective_priority     = priority - waited_ms * effective_aging_factor
/// ```
///
/// An incoming element is inserted before the first node whose effective
/// priority is strictly greater than its own, so equal priorities keep their
/// arrival order and long waiting elements cannot starve.
#[derive(Debug)]
pub struct FixedPriorityQueue<T> {
    ring: Ring<T>,
    aging_factor: f64,
    load_exponent: f64,
}

impl<T> FixedPriorityQueue<T> {
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::InvalidCapacity(capacity));
        }
        Ok(Self::with_capacity(capacity))
    }

    /// # Arguments
    /// * `aging_factor` - Finite, non negative priority decrease per waited millisecond
    /// * `load_exponent` - Finite, positive exponent applied to the queue load
    pub fn with_aging(
        capacity: usize,
        aging_factor: f64,
        load_exponent: f64,
    ) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::InvalidQueueSize(capacity));
        }
        let valid = aging_factor.is_finite()
            && aging_factor >= 0.0
            && load_exponent.is_finite()
            && load_exponent > 0.0;
        if !valid {
            return Err(ConfigError::InvalidAging {
                factor: aging_factor,
                load_exponent,
            });
        }
        Ok(Self {
            ring: Ring::with_capacity(capacity),
            aging_factor,
            load_exponent,
        })
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: Ring::with_capacity(capacity),
            aging_factor: DEFAULT_AGING_FACTOR,
            load_exponent: DEFAULT_LOAD_EXPONENT,
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

    /// Inserts `data` at its effective priority position and returns the new size.
    /// Priorities outside the task priority range are clamped into it.
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
        let node = FixedQueueNode::new(data, priority);
        let position = self.insertion_position(node.priority, node.timestamp);
        self.ring.insert(position, node);
    }

    fn insertion_position(&self, priority: i32, now: Instant) -> usize {
        let load = (self.ring.len() + 1) as f64 / self.capacity() as f64;
        let effective_aging_factor = self.aging_factor * (1.0 + load.powf(self.load_exponent));
        let incoming = f64::from(priority);
        self.ring
            .position(|node| {
                let waited_ms = now.saturating_duration_since(node.timestamp).as_secs_f64() * 1000.0;
                f64::from(node.priority) - waited_ms * effective_aging_factor > incoming
            })
            .unwrap_or(self.ring.len())
    }

    pub fn dequeue(&mut self) -> Option<T> {
        self.ring.pop_front().map(|node| node.data)
    }

    pub(crate) fn dequeue_node(&mut self) -> Option<FixedQueueNode<T>> {
        self.ring.pop_front()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.ring.get(index).map(|node| &node.data)
    }

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

impl<'a, T> IntoIterator for &'a FixedPriorityQueue<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
