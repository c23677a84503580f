//! Registration keys and their routing-key wire encoding.
//!
//! A registration key says *what* an event must match to reach an ephemeral
//! subscriber. On the wire it becomes a routing key of the form
//! `<family>:<value>`. Decoding looks the family up among the factories the
//! converter was built with.
//!
//! The empty routing key ([`WILDCARD_ROUTING_KEY`]) is reserved: group work
//! queues bind with it and therefore receive every event.

mod keys;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub use keys::{
    MailboxIdRegistrationKey, MailboxIdRegistrationKeyFactory, UsernameRegistrationKey,
    UsernameRegistrationKeyFactory,
};

/// Routing key matched by every group work queue.
pub const WILDCARD_ROUTING_KEY: &str = "";

/// Separator between family id and value.
const SEPARATOR: char = ':';

/// Result type for routing key operations.
pub type Result<T> = std::result::Result<T, RoutingKeyError>;

/// Errors raised while decoding routing keys.
#[derive(Debug, thiserror::Error)]
pub enum RoutingKeyError {
    /// No factory was registered for the family. This is a configuration
    /// fault and is never retried.
    #[error("No factory for registration key family '{0}'")]
    NoFactory(String),

    #[error("Malformed routing key '{0}'")]
    Malformed(String),

    #[error("Invalid value '{value}' for registration key family '{family}'")]
    InvalidValue { family: String, value: String },
}

/// A typed filter criterion for ephemeral subscriptions.
///
/// Concrete key kinds ([`MailboxIdRegistrationKey`], [`UsernameRegistrationKey`])
/// convert into this type-erased form, which is what the bus stores and routes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationKey {
    family: Arc<str>,
    value: String,
}

impl RegistrationKey {
    pub fn new(family: impl Into<Arc<str>>, value: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            value: value.into(),
        }
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Wire representation: `<family>:<value>`.
    pub fn routing_key(&self) -> String {
        format!("{}{}{}", self.family, SEPARATOR, self.value)
    }
}

impl fmt::Display for RegistrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.family, SEPARATOR, self.value)
    }
}

/// Builds registration keys of one family from their string value.
pub trait RegistrationKeyFactory: Send + Sync {
    /// Family id this factory decodes.
    fn family(&self) -> &str;

    fn from_value(&self, value: &str) -> Result<RegistrationKey>;
}

/// Encodes and decodes registration keys to and from routing keys.
#[derive(Clone)]
pub struct RoutingKeyConverter {
    factories: HashMap<String, Arc<dyn RegistrationKeyFactory>>,
}

impl RoutingKeyConverter {
    pub fn for_factories(factories: Vec<Arc<dyn RegistrationKeyFactory>>) -> Self {
        Self {
            factories: factories
                .into_iter()
                .map(|factory| (factory.family().to_string(), factory))
                .collect(),
        }
    }

    /// Converter knowing the mailbox id and username key families.
    pub fn with_default_factories() -> Self {
        Self::for_factories(vec![
            Arc::new(MailboxIdRegistrationKeyFactory),
            Arc::new(UsernameRegistrationKeyFactory),
        ])
    }

    pub fn encode(&self, key: &RegistrationKey) -> String {
        key.routing_key()
    }

    pub fn decode(&self, routing_key: &str) -> Result<RegistrationKey> {
        let (family, value) = routing_key
            .split_once(SEPARATOR)
            .ok_or_else(|| RoutingKeyError::Malformed(routing_key.to_string()))?;

        let factory = self
            .factories
            .get(family)
            .ok_or_else(|| RoutingKeyError::NoFactory(family.to_string()))?;

        factory.from_value(value)
    }
}

impl fmt::Debug for RoutingKeyConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingKeyConverter")
            .field("families", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
