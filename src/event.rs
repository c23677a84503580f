//! Event identity and the opaque event contract.
//!
//! The bus never inspects event payloads. It only needs to know how to
//! identify an event, who it belongs to, and whether it carries any change
//! at all (noop events are dropped before touching the broker).

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a fresh random event id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Owner of the mailbox an event relates to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
    pub fn of(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A mailbox state change travelling on the bus.
///
/// Events are immutable once created and shared between listeners behind an
/// `Arc`. Concrete types are supplied by the mailbox layer; `as_any` lets a
/// serializer recover the concrete type.
pub trait Event: fmt::Debug + Send + Sync + 'static {
    fn event_id(&self) -> EventId;

    fn username(&self) -> &Username;

    /// Whether this event describes no actual change.
    fn is_noop(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;
}
