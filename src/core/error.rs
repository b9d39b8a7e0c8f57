use std::fmt;

/// Errors surfaced by the queue backends and the broker client.
#[derive(Debug)]
pub enum QueueError {
    /// Event could not be serialized for publishing.
    Encode(serde_json::Error),
    /// A received payload could not be deserialized into an event.
    Decode(serde_json::Error),
    /// The broker rejected a publish or the write failed.
    Publish(String),
    /// A producer/consumer session could not be established or was lost.
    Connection(String),
    /// The queue is at capacity and rejected the entry.
    QueueFull,
    /// The queue or its broker session has been closed.
    Closed,
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueueError::Encode(e) | QueueError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Encode(e) => write!(f, "failed to encode event: {e}"),
            QueueError::Decode(e) => write!(f, "failed to decode event payload: {e}"),
            QueueError::Publish(msg) => write!(f, "publish failed: {msg}"),
            QueueError::Connection(msg) => write!(f, "broker connection failed: {msg}"),
            QueueError::QueueFull => write!(f, "queue is at capacity"),
            QueueError::Closed => write!(f, "queue is closed"),
        }
    }
}
