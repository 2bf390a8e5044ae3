//! Batch accumulator (spec.md §4.4): a fixed-capacity buffer guarded by a
//! single mutex, never partially appended, always reset on flush.

use std::sync::Mutex;

struct BatchBuffer {
    data: Vec<u8>,
    capacity: usize,
    position: usize,
}

#[derive(Debug)]
pub struct BatchAccumulator {
    buffer: Mutex<BatchBuffer>,
}

impl BatchAccumulator {
    pub fn new(capacity: usize) -> Self {
        BatchAccumulator {
            buffer: Mutex::new(BatchBuffer {
                data: vec![0u8; capacity],
                capacity,
                position: 0,
            }),
        }
    }

    /// Appends `bytes` to the buffer, returning `false` and leaving the
    /// buffer untouched if it would not fit. Never partially appends.
    pub fn append(&self, bytes: &[u8]) -> bool {
        let mut guard = self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.position + bytes.len() > guard.capacity {
            return false;
        }
        let start = guard.position;
        let end = start + bytes.len();
        guard.data[start..end].copy_from_slice(bytes);
        guard.position = end;
        true
    }

    pub fn current_size(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).position
    }

    pub fn capacity(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).capacity
    }

    /// Removes and returns the buffered bytes, resetting the position to
    /// zero unconditionally — callers still see the reset even if everything
    /// past this point (acquiring a connection, running the copy) fails.
    pub fn take_for_flush(&self) -> Vec<u8> {
        let mut guard = self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let drained = guard.data[..guard.position].to_vec();
        guard.position = 0;
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_fits_exactly_at_capacity() {
        let acc = BatchAccumulator::new(10);
        assert!(acc.append(&[0u8; 10]));
        assert_eq!(acc.current_size(), 10);
    }

    #[test]
    fn append_rejects_overflow_without_partial_write() {
        let acc = BatchAccumulator::new(10);
        assert!(acc.append(&[0u8; 6]));
        assert!(!acc.append(&[0u8; 6]));
        assert_eq!(acc.current_size(), 6, "rejected append must not mutate the buffer");
    }

    #[test]
    fn flush_resets_position_even_when_empty() {
        let acc = BatchAccumulator::new(10);
        let drained = acc.take_for_flush();
        assert!(drained.is_empty());
        assert_eq!(acc.current_size(), 0);
    }

    #[test]
    fn flush_drains_and_resets_position() {
        let acc = BatchAccumulator::new(10);
        acc.append(&[1, 2, 3]);
        let drained = acc.take_for_flush();
        assert_eq!(drained, vec![1, 2, 3]);
        assert_eq!(acc.current_size(), 0);
        assert!(acc.append(&[0u8; 10]));
    }
}
