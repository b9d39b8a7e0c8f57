//! Event queue module.
//!
//! Defines the queue abstraction shared by both backends and the two
//! pluggable implementations:
//! - [`InMemoryQueue`] — ephemeral, bounded, in-process only
//! - [`DurableQueue`] — broker-backed, at-least-once delivery

pub mod durable;
pub mod memory;

pub use durable::DurableQueue;
pub use memory::InMemoryQueue;

use async_trait::async_trait;

use crate::core::error::QueueError;

/// The four-operation contract shared by every queue backend.
///
/// Entries are held in FIFO arrival order; `get` is a non-destructive peek
/// and `remove` is the only operation that shrinks the queue (and, for the
/// durable backend, the only one that acknowledges delivery).
#[async_trait]
pub trait EventQueue<T>: Send + Sync {
    /// Appends one event at the tail.
    ///
    /// Capacity policy is *reject*: a queue at capacity returns
    /// [`QueueError::QueueFull`] rather than blocking or evicting. The
    /// durable backend publishes to the broker instead of buffering
    /// locally, so it surfaces encode/publish failures here.
    async fn add(&self, event: T) -> Result<(), QueueError>;

    /// Returns up to `count` events from the head without removing or
    /// acknowledging them. Repeated calls observe the same entries until
    /// `remove` is called.
    ///
    /// On the durable backend a staged payload that fails to decode makes
    /// the whole peek fail with [`QueueError::Decode`]; the poison entry
    /// stays in place (still unacknowledged) until `remove` drains it.
    async fn get(&self, count: usize) -> Result<Vec<T>, QueueError>;

    /// Dequeues up to `count` entries from the head, yielding one result
    /// per entry in FIFO order.
    ///
    /// The durable backend acknowledges every dequeued envelope exactly
    /// once, decode success or not, so an undecodable message is reported
    /// in its slot instead of being redelivered forever.
    async fn remove(&self, count: usize) -> Vec<Result<T, QueueError>>;

    /// Current entry count.
    fn size(&self) -> usize;
}
