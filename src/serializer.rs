//! Event (de)serialization collaborator.
//!
//! Events travel on the broker as UTF-8 JSON. The bus only ever serializes
//! an event once per dispatch and hands the same bytes to every publish.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::event::Event;

/// Result type for serialization operations.
pub type Result<T> = std::result::Result<T, SerializationError>;

#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("Failed to serialize event: {0}")]
    Serialize(String),

    #[error("Failed to deserialize event: {0}")]
    Deserialize(String),
}

/// Converts events to and from their wire form.
pub trait EventSerializer: Send + Sync {
    fn to_bytes(&self, event: &dyn Event) -> Result<Vec<u8>>;

    fn from_bytes(&self, bytes: &[u8]) -> Result<Arc<dyn Event>>;
}

/// JSON serializer for a single concrete event type `E`.
///
/// Mailbox layers typically model their events as one serde-tagged enum, so
/// a single concrete type covers the whole event family.
pub struct JsonEventSerializer<E> {
    _event: PhantomData<fn() -> E>,
}

impl<E> JsonEventSerializer<E> {
    pub fn new() -> Self {
        Self {
            _event: PhantomData,
        }
    }
}

impl<E> Default for JsonEventSerializer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventSerializer for JsonEventSerializer<E>
where
    E: Event + Serialize + DeserializeOwned,
{
    fn to_bytes(&self, event: &dyn Event) -> Result<Vec<u8>> {
        let concrete = event.as_any().downcast_ref::<E>().ok_or_else(|| {
            SerializationError::Serialize(format!(
                "unsupported event type for {}",
                std::any::type_name::<E>()
            ))
        })?;
        serde_json::to_vec(concrete).map_err(|e| SerializationError::Serialize(e.to_string()))
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Arc<dyn Event>> {
        let event: E = serde_json::from_slice(bytes)
            .map_err(|e| SerializationError::Deserialize(e.to_string()))?;
        Ok(Arc::new(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_event, TestEvent};

    #[test]
    fn test_round_trip_preserves_identity() {
        let serializer = JsonEventSerializer::<TestEvent>::new();
        let event = test_event();

        let bytes = serializer.to_bytes(event.as_ref()).unwrap();
        let decoded = serializer.from_bytes(&bytes).unwrap();

        assert_eq!(decoded.event_id(), event.event_id());
        assert_eq!(decoded.username(), event.username());
    }

    #[test]
    fn test_produces_utf8_json() {
        let serializer = JsonEventSerializer::<TestEvent>::new();
        let bytes = serializer.to_bytes(test_event().as_ref()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("event_id").is_some());
    }

    #[test]
    fn test_bad_payload_is_deserialize_error() {
        let serializer = JsonEventSerializer::<TestEvent>::new();
        assert!(matches!(
            serializer.from_bytes(b"BAD_PAYLOAD!"),
            Err(SerializationError::Deserialize(_))
        ));
    }

    #[test]
    fn test_foreign_event_type_is_serialize_error() {
        #[derive(Debug)]
        struct Other(crate::event::Username);

        impl Event for Other {
            fn event_id(&self) -> crate::event::EventId {
                crate::event::EventId::random()
            }
            fn username(&self) -> &crate::event::Username {
                &self.0
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }

        let serializer = JsonEventSerializer::<TestEvent>::new();
        let other = Other(crate::event::Username::of("bob"));
        assert!(matches!(
            serializer.to_bytes(&other),
            Err(SerializationError::Serialize(_))
        ));
    }
}
