//! Event payload codec.
//!
//! Events are caller-supplied opaque values; the only requirement is that
//! they round-trip exactly through `encode`/`decode`. JSON keeps the wire
//! payload self-describing so an external consumer on the same topic can
//! read it without sharing Rust types.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::error::QueueError;

/// Serializes an event into its wire payload.
pub fn encode<T: Serialize>(event: &T) -> Result<Bytes, QueueError> {
    serde_json::to_vec(event)
        .map(Bytes::from)
        .map_err(QueueError::Encode)
}

/// Deserializes a wire payload back into an event.
///
/// Malformed input is an error; it is never mapped to a default-valued
/// event.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, QueueError> {
    serde_json::from_slice(body).map_err(QueueError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct UserEvent {
        user_id: String,
        campaign: String,
        revenue: i64,
    }

    #[test]
    fn round_trips_exactly() {
        let event = UserEvent {
            user_id: "u-42".into(),
            campaign: "spring".into(),
            revenue: 1799,
        };
        let body = encode(&event).unwrap();
        let back: UserEvent = decode(&body).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let err = decode::<UserEvent>(b"not json at all").unwrap_err();
        assert!(matches!(err, QueueError::Decode(_)));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let event = UserEvent {
            user_id: "u".into(),
            campaign: "c".into(),
            revenue: 0,
        };
        let body = encode(&event).unwrap();
        let err = decode::<UserEvent>(&body[..body.len() - 2]).unwrap_err();
        assert!(matches!(err, QueueError::Decode(_)));
    }
}
