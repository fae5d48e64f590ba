//! Task queues.
//!
//! - [`FixedQueue`]: bounded FIFO ring buffer.
//! - [`FixedPriorityQueue`]: bounded ring buffer ordered by effective
//!   priority, with load-aware aging.
//! - [`PriorityQueue`]: unbounded queue chaining fixed-capacity buckets of
//!   either kind. Each worker node owns one for its pending tasks.

mod fixed;
mod fixed_priority;
mod priority;

pub use fixed::{DEFAULT_QUEUE_SIZE, FixedQueue, FixedQueueNode, Iter};
pub use fixed_priority::{DEFAULT_AGING_FACTOR, DEFAULT_LOAD_EXPONENT, FixedPriorityQueue};
pub use priority::{DEFAULT_BUCKET_SIZE, PriorityQueue, PriorityQueueIter};
