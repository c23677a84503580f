//! Mailbus - distributed mailbox event bus
//!
//! Fans mailbox change events out to listeners running in any process
//! attached to the same message broker.
//!
//! - Key listeners are ephemeral and per process. They receive events
//!   dispatched with a matching registration key.
//! - Group listeners are durable. Each event reaches a group once,
//!   whichever process consumes it, with retries and dead-lettering on
//!   failure.

pub mod broker;
pub mod bus;
pub mod config;
pub mod dlq;
pub mod event;
pub mod group;
pub mod listener;
pub mod registration;
pub mod retry;
pub mod routing;
pub mod serializer;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use bus::{BusError, EventBus, EventBusBuilder, EventBusId};
pub use event::{Event, EventId, Username};
pub use group::Group;
pub use listener::{EventListener, ExecutionMode, ListenerError};
pub use registration::Registration;
pub use routing::RegistrationKey;
