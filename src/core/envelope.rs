use bytes::Bytes;

/// A message as received from the broker: the serialized event payload plus
/// the delivery token needed to acknowledge it later.
///
/// Envelopes are owned by the staging buffer until they are either
/// acknowledged (via `remove`) or dropped unacked, in which case the broker
/// redelivers them after the requeue wait.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Broker-assigned message id; the acknowledgment handle.
    pub id: u64,
    /// Codec-serialized event payload.
    pub body: Bytes,
}
