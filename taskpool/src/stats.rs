use std::fmt;

use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use taskpool_api::errors::ConfigError;

/// Default number of samples kept per measurement window.
pub const DEFAULT_MEASUREMENT_HISTORY_SIZE: usize = 64;

/// Rolling window of the most recent measurement samples.
///
/// `put` on a full buffer overwrites the oldest sample. The buffer only stores
/// samples; averaging and other aggregation belong to its readers.
pub struct StatisticsRingBuffer {
    buffer: HeapRb<f64>,
}

impl StatisticsRingBuffer {
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::InvalidBufferSize(capacity));
        }
        Ok(Self {
            buffer: HeapRb::new(capacity),
        })
    }

    pub fn put(&mut self, value: f64) {
        self.buffer.push_overwrite(value);
    }

    /// Removes and returns the oldest sample.
    pub fn get(&mut self) -> Option<f64> {
        self.buffer.try_pop()
    }

    /// Samples in insertion order, oldest first.
    pub fn to_vec(&self) -> Vec<f64> {
        self.buffer.iter().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.buffer.iter().copied()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity().get()
    }

    pub fn len(&self) -> usize {
        self.buffer.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.is_full()
    }
}

impl fmt::Debug for StatisticsRingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatisticsRingBuffer")
            .field("capacity", &self.capacity())
            .field("samples", &self.to_vec())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert_eq!(
            StatisticsRingBuffer::new(0).unwrap_err(),
            ConfigError::InvalidBufferSize(0)
        );
    }

    #[test]
    fn test_put_and_get() {
        let mut buffer = StatisticsRingBuffer::new(3).unwrap();
        assert!(buffer.is_empty());
        buffer.put(1.0);
        buffer.put(2.5);
        assert_eq!(buffer.len(), 2);
        assert!(!buffer.is_full());
        assert_eq!(buffer.get(), Some(1.0));
        assert_eq!(buffer.get(), Some(2.5));
        assert_eq!(buffer.get(), None);
    }

    #[test]
    fn test_overflow_keeps_last_capacity_samples() {
        let capacity = 4;
        let extra = 3;
        let mut buffer = StatisticsRingBuffer::new(capacity).unwrap();
        for sample in 0..capacity + extra {
            buffer.put(sample as f64);
        }
        assert!(buffer.is_full());
        assert_eq!(buffer.capacity(), capacity);
        assert_eq!(buffer.to_vec(), vec![3.0, 4.0, 5.0, 6.0]);
        assert_eq!(buffer.iter().sum::<f64>(), 18.0);
        assert_eq!(buffer.get(), Some(3.0));
        assert_eq!(buffer.len(), capacity - 1);
    }
}
