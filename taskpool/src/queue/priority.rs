use taskpool_api::errors::QueueError;

use super::fixed::{FixedQueue, FixedQueueNode};
use super::fixed_priority::FixedPriorityQueue;

/// Default number of elements per bucket.
pub const DEFAULT_BUCKET_SIZE: usize = super::fixed::DEFAULT_QUEUE_SIZE;

enum Bucket<T> {
    Fifo(FixedQueue<T>),
    Priority(FixedPriorityQueue<T>),
}

impl<T> Bucket<T> {
    fn with_capacity(capacity: usize, priority: bool) -> Self {
        if priority {
            Bucket::Priority(FixedPriorityQueue::with_capacity(capacity))
        } else {
            Bucket::Fifo(FixedQueue::with_capacity(capacity))
        }
    }

    fn len(&self) -> usize {
        match self {
            Bucket::Fifo(queue) => queue.len(),
            Bucket::Priority(queue) => queue.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_full(&self) -> bool {
        match self {
            Bucket::Fifo(queue) => queue.is_full(),
            Bucket::Priority(queue) => queue.is_full(),
        }
    }

    fn push(&mut self, data: T, priority: i32) {
        match self {
            Bucket::Fifo(queue) => queue.push(data, priority),
            Bucket::Priority(queue) => queue.push(data, priority),
        }
    }

    fn dequeue_node(&mut self) -> Option<FixedQueueNode<T>> {
        match self {
            Bucket::Fifo(queue) => queue.dequeue_node(),
            Bucket::Priority(queue) => queue.dequeue_node(),
        }
    }

    fn get(&self, index: usize) -> Option<&T> {
        match self {
            Bucket::Fifo(queue) => queue.get(index),
            Bucket::Priority(queue) => queue.get(index),
        }
    }

    fn delete(&mut self, data: &T) -> bool
    where
        T: PartialEq,
    {
        match self {
            Bucket::Fifo(queue) => queue.delete(data),
            Bucket::Priority(queue) => queue.delete(data),
        }
    }
}

struct PriorityQueueNode<T> {
    bucket: Bucket<T>,
    next: Option<usize>,
}

/// Unbounded queue made of a chain of fixed-capacity buckets.
///
/// Buckets live in an arena and are linked by index from `tail` (oldest) to
/// `head` (the one being filled). A bucket is unlinked as soon as it becomes
/// empty, unless it is the only one left. Unlinked slots are recycled.
///
/// With priority enabled each bucket orders its elements by effective
/// priority (see [`FixedPriorityQueue`]), otherwise buckets are plain FIFO.
pub struct PriorityQueue<T> {
    nodes: Vec<PriorityQueueNode<T>>,
    free: Vec<usize>,
    tail: usize,
    head: usize,
    bucket_size: usize,
    enable_priority: bool,
    size: usize,
    max_size: usize,
}

impl<T> PriorityQueue<T> {
    /// # Arguments
    /// * `bucket_size` - Capacity of each bucket, must be positive
    /// * `enable_priority` - Whether buckets are ordered by effective priority
    pub fn new(bucket_size: usize, enable_priority: bool) -> Result<Self, QueueError> {
        if bucket_size == 0 {
            return Err(QueueError::InvalidBucketSize(bucket_size));
        }
        Ok(Self::with_bucket_size(bucket_size, enable_priority))
    }

    /// Infallible constructor for callers holding a known positive bucket size.
    pub(crate) fn with_bucket_size(bucket_size: usize, enable_priority: bool) -> Self {
        let bucket_size = bucket_size.max(1);
        Self {
            nodes: vec![PriorityQueueNode {
                bucket: Bucket::with_capacity(bucket_size, enable_priority),
                next: None,
            }],
            free: Vec::new(),
            tail: 0,
            head: 0,
            bucket_size,
            enable_priority,
            size: 0,
            max_size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Highest size reached since construction or the last [`clear`](Self::clear).
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Number of completely filled buckets worth of elements.
    pub fn buckets(&self) -> usize {
        self.size / self.bucket_size
    }

    pub fn enable_priority(&self) -> bool {
        self.enable_priority
    }

    /// Switches bucket ordering, migrating every element into new buckets.
    pub fn set_enable_priority(&mut self, enable_priority: bool) {
        if self.enable_priority == enable_priority {
            return;
        }
        let mut drained = Vec::with_capacity(self.size);
        let mut current = Some(self.tail);
        while let Some(index) = current {
            while let Some(node) = self.nodes[index].bucket.dequeue_node() {
                drained.push(node);
            }
            current = self.nodes[index].next;
        }
        let max_size = self.max_size;
        self.enable_priority = enable_priority;
        self.clear();
        for node in drained {
            self.enqueue(node.data, Some(node.priority));
        }
        self.max_size = max_size;
    }

    /// Appends `data` to the head bucket, allocating a new one when it is full,
    /// and returns the new size.
    pub fn enqueue(&mut self, data: T, priority: Option<i32>) -> usize {
        if self.nodes[self.head].bucket.is_full() {
            let index = self.allocate();
            self.nodes[self.head].next = Some(index);
            self.head = index;
        }
        self.nodes[self.head]
            .bucket
            .push(data, priority.unwrap_or(taskpool_api::task::DEFAULT_PRIORITY));
        self.size += 1;
        self.max_size = self.max_size.max(self.size);
        self.size
    }

    /// Dequeues from the oldest bucket, or from the 1-based `bucket` of the chain.
    ///
    /// Returns `None` when the requested bucket does not exist or is empty.
    pub fn dequeue(&mut self, bucket: Option<usize>) -> Option<T> {
        let (index, previous) = match bucket {
            None => (self.tail, None),
            Some(bucket) => self.locate(bucket)?,
        };
        let node = self.nodes[index].bucket.dequeue_node()?;
        self.size -= 1;
        self.unlink_if_empty(index, previous);
        Some(node.data)
    }

    /// Removes the first element equal to `data`, scanning from the oldest bucket.
    pub fn delete(&mut self, data: &T) -> bool
    where
        T: PartialEq,
    {
        let mut previous = None;
        let mut current = Some(self.tail);
        while let Some(index) = current {
            if self.nodes[index].bucket.delete(data) {
                self.size -= 1;
                self.unlink_if_empty(index, previous);
                return true;
            }
            previous = Some(index);
            current = self.nodes[index].next;
        }
        false
    }

    /// Resets the queue to a single empty bucket.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.nodes.push(PriorityQueueNode {
            bucket: Bucket::with_capacity(self.bucket_size, self.enable_priority),
            next: None,
        });
        self.free.clear();
        self.tail = 0;
        self.head = 0;
        self.size = 0;
        self.max_size = 0;
    }

    pub fn iter(&self) -> PriorityQueueIter<'_, T> {
        PriorityQueueIter {
            queue: self,
            bucket: Some(self.tail),
            index: 0,
        }
    }

    fn allocate(&mut self) -> usize {
        let node = PriorityQueueNode {
            bucket: Bucket::with_capacity(self.bucket_size, self.enable_priority),
            next: None,
        };
        match self.free.pop() {
            Some(index) => {
                self.nodes[index] = node;
                index
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Arena index of the 1-based `bucket` and of its predecessor.
    fn locate(&self, bucket: usize) -> Option<(usize, Option<usize>)> {
        if bucket == 0 {
            return None;
        }
        let mut previous = None;
        let mut current = self.tail;
        for _ in 1..bucket {
            previous = Some(current);
            current = self.nodes[current].next?;
        }
        Some((current, previous))
    }

    fn unlink_if_empty(&mut self, index: usize, previous: Option<usize>) {
        if !self.nodes[index].bucket.is_empty() || self.tail == self.head {
            return;
        }
        let next = self.nodes[index].next.take();
        match previous {
            None => match next {
                Some(next) => self.tail = next,
                None => return,
            },
            Some(previous) => {
                self.nodes[previous].next = next;
                if index == self.head {
                    self.head = previous;
                }
            }
        }
        self.free.push(index);
    }
}

impl<T> std::fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("size", &self.size)
            .field("max_size", &self.max_size)
            .field("bucket_size", &self.bucket_size)
            .field("enable_priority", &self.enable_priority)
            .field("tail", &self.tail)
            .field("head", &self.head)
            .finish()
    }
}

/// Iterator over a [`PriorityQueue`], oldest bucket first.
pub struct PriorityQueueIter<'a, T> {
    queue: &'a PriorityQueue<T>,
    bucket: Option<usize>,
    index: usize,
}

impl<'a, T> Iterator for PriorityQueueIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = &self.queue.nodes[self.bucket?];
            if let Some(data) = node.bucket.get(self.index) {
                self.index += 1;
                return Some(data);
            }
            self.bucket = node.next;
            self.index = 0;
        }
    }
}

impl<'a, T> IntoIterator for &'a PriorityQueue<T> {
    type Item = &'a T;
    type IntoIter = PriorityQueueIter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
