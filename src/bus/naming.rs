//! Broker resource names.
//!
//! Every exchange and queue a bus touches is prefixed with its
//! [`EventBusName`], so buses with different names share a broker without
//! seeing each other's events.

use std::fmt;

use crate::group::Group;

use super::{EventBusId, DEFAULT_BUS_NAME};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventBusName(String);

impl EventBusName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventBusName {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_NAME)
    }
}

impl fmt::Display for EventBusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives broker resource names from a bus name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamingStrategy {
    name: EventBusName,
}

impl NamingStrategy {
    pub fn new(name: EventBusName) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &EventBusName {
        &self.name
    }

    /// Main direct exchange every event is published to.
    pub fn exchange(&self) -> String {
        format!("{}-exchange", self.name)
    }

    /// Durable work queue shared by every instance hosting `group`.
    pub fn work_queue(&self, group: &Group) -> String {
        format!("{}-workQueue-{}", self.name, group.as_string())
    }

    pub fn retry_exchange(&self, group: &Group) -> String {
        format!("{}-retryExchange-{}", self.name, group.as_string())
    }

    pub fn dead_letter_exchange(&self) -> String {
        format!("{}-dead-letter-exchange", self.name)
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}-dead-letter-queue", self.name)
    }

    /// Private key-subscription queue of one bus instance.
    pub fn key_queue(&self, id: &EventBusId) -> String {
        format!("{}-eventbus-{}", self.name, id)
    }

    /// Group under which events whose publication failed are stored.
    pub fn dispatching_failure_group(&self) -> Group {
        Group::dispatching_failure(self.name.as_str())
    }
}
