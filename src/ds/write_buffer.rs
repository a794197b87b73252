//! Bounded MPSC buffer of write tasks.
//!
//! Mutations record a task here after updating the primary map, so policy
//! bookkeeping happens off the write hot path. Unlike read events, write
//! tasks are never dropped — they drive weight accounting — so a full
//! buffer pushes back: the producer gets the task returned and must force a
//! maintenance pass before retrying.
//!
//! Backed by a lock-free `crossbeam_queue::ArrayQueue`; multiple producers,
//! one drainer (the thread holding the eviction lock).

use crossbeam_queue::ArrayQueue;

/// Default task capacity. Tasks beyond this stall their producer until a
/// drain catches up, which bounds how far policy state can lag the map.
pub const WRITE_BUFFER_CAPACITY: usize = 128;

/// Bounded multi-producer single-consumer task queue.
#[derive(Debug)]
pub struct WriteBuffer<T> {
    queue: ArrayQueue<T>,
}

impl<T> WriteBuffer<T> {
    /// Creates a buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(WRITE_BUFFER_CAPACITY)
    }

    /// Creates a buffer holding at most `capacity` undrained tasks.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Enqueues `task`, or returns it when the buffer is full.
    ///
    /// A returned task must not be discarded; the caller drains under the
    /// eviction lock and retries.
    #[inline]
    pub fn push(&self, task: T) -> Result<(), T> {
        self.queue.push(task)
    }

    /// Removes and returns one task, oldest first.
    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Returns `true` when no tasks are queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns `true` when the buffer is at capacity.
    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Maximum number of undrained tasks.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl<T> Default for WriteBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_is_fifo() {
        let buffer = WriteBuffer::with_capacity(4);
        buffer.push(1).unwrap();
        buffer.push(2).unwrap();
        buffer.push(3).unwrap();
        assert_eq!(buffer.pop(), Some(1));
        assert_eq!(buffer.pop(), Some(2));
        assert_eq!(buffer.pop(), Some(3));
        assert_eq!(buffer.pop(), None);
    }

    #[test]
    fn full_buffer_returns_task() {
        let buffer = WriteBuffer::with_capacity(2);
        buffer.push("a").unwrap();
        buffer.push("b").unwrap();
        assert!(buffer.is_full());
        assert_eq!(buffer.push("c"), Err("c"));

        assert_eq!(buffer.pop(), Some("a"));
        buffer.push("c").unwrap();
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        use std::sync::Arc;
        let buffer = Arc::new(WriteBuffer::with_capacity(1024));
        let mut handles = Vec::new();
        for t in 0..8u64 {
            let buffer = Arc::clone(&buffer);
            handles.push(std::thread::spawn(move || {
                for i in 0..100u64 {
                    buffer.push(t * 100 + i).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        while let Some(task) = buffer.pop() {
            assert!(seen.insert(task));
        }
        assert_eq!(seen.len(), 800);
    }
}
