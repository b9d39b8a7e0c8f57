use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::error::QueueError;
use crate::core::queue::EventQueue;

/// Bounded FIFO buffer guarded by a mutex.
///
/// Usable standalone as an ephemeral event queue, and reused as the staging
/// buffer inside [`DurableQueue`](crate::core::queue::DurableQueue). A full
/// queue rejects new entries with [`QueueError::QueueFull`]; it never blocks
/// and never evicts.
#[derive(Debug)]
pub struct InMemoryQueue<T> {
    capacity: usize,
    entries: Mutex<VecDeque<T>>,
}

impl<T> InMemoryQueue<T> {
    /// Creates an empty queue with the given fixed capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Appends an entry at the tail, rejecting it if the queue is full.
    pub fn push(&self, entry: T) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        if entries.len() >= self.capacity {
            return Err(QueueError::QueueFull);
        }
        entries.push_back(entry);
        Ok(())
    }

    /// Removes and returns up to `count` entries from the head.
    pub fn pop(&self, count: usize) -> Vec<T> {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        let n = count.min(entries.len());
        entries.drain(..n).collect()
    }

    /// Current entry count.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue capacity fixed at construction.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> InMemoryQueue<T> {
    /// Clones up to `count` entries from the head without removing them.
    pub fn peek(&self, count: usize) -> Vec<T> {
        let entries = self.entries.lock().expect("queue lock poisoned");
        entries.iter().take(count).cloned().collect()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> EventQueue<T> for InMemoryQueue<T> {
    async fn add(&self, event: T) -> Result<(), QueueError> {
        self.push(event)
    }

    async fn get(&self, count: usize) -> Result<Vec<T>, QueueError> {
        Ok(self.peek(count))
    }

    async fn remove(&self, count: usize) -> Vec<Result<T, QueueError>> {
        self.pop(count).into_iter().map(Ok).collect()
    }

    fn size(&self) -> usize {
        self.len()
    }
}
