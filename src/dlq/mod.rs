//! Dead-letter store for events whose group processing gave up.
//!
//! The group retry handler appends here once an event exhausted its retries,
//! and the dispatcher appends here (under the dispatching-failure group) when
//! the broker refused a publish. Operational tooling reads entries back and
//! hands them to `EventBus::redeliver`.
//!
//! ## Keys
//!
//! Entries are keyed by `(group, insertion id)`. The same event may be stored
//! several times for one group (for instance after a failed redelivery), each
//! store yielding a fresh [`InsertionId`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::{Event, EventId};
use crate::group::Group;

/// Result type for dead-letter operations.
pub type Result<T> = std::result::Result<T, DeadLetterError>;

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("Dead-letter storage error: {0}")]
    Storage(String),
}

/// Identifier of one stored dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsertionId(Uuid);

impl InsertionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for InsertionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Durable record of events that failed group processing.
#[async_trait]
pub trait EventDeadLetters: Send + Sync {
    /// Record `event` as failed for `group`.
    async fn store(&self, group: &Group, event: Arc<dyn Event>) -> Result<InsertionId>;

    /// Every failed event for `group`, oldest first.
    async fn list(&self, group: &Group) -> Result<Vec<Arc<dyn Event>>>;

    /// Drop every entry of `group` holding `event_id`.
    async fn remove(&self, group: &Group, event_id: EventId) -> Result<()>;

    async fn failed_event(
        &self,
        group: &Group,
        insertion_id: InsertionId,
    ) -> Result<Option<Arc<dyn Event>>>;

    async fn failed_ids(&self, group: &Group) -> Result<Vec<InsertionId>>;

    async fn remove_all(&self, group: &Group) -> Result<()>;

    async fn groups_with_failed_events(&self) -> Result<Vec<Group>>;

    /// Whether any group holds at least one failed event.
    async fn contain_events(&self) -> Result<bool>;
}

/// In-memory dead-letter store.
///
/// Used for standalone mode and testing. Entries do not survive a restart.
#[derive(Default)]
pub struct MemoryEventDeadLetters {
    entries: DashMap<Group, Vec<(InsertionId, Arc<dyn Event>)>>,
}

impl MemoryEventDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventDeadLetters for MemoryEventDeadLetters {
    async fn store(&self, group: &Group, event: Arc<dyn Event>) -> Result<InsertionId> {
        let insertion_id = InsertionId::random();
        debug!(
            group = %group,
            event_id = %event.event_id(),
            insertion_id = %insertion_id,
            "Storing dead letter"
        );
        self.entries
            .entry(group.clone())
            .or_default()
            .push((insertion_id, event));
        Ok(insertion_id)
    }

    async fn list(&self, group: &Group) -> Result<Vec<Arc<dyn Event>>> {
        Ok(self
            .entries
            .get(group)
            .map(|entries| entries.iter().map(|(_, event)| Arc::clone(event)).collect())
            .unwrap_or_default())
    }

    async fn remove(&self, group: &Group, event_id: EventId) -> Result<()> {
        if let Some(mut entries) = self.entries.get_mut(group) {
            entries.retain(|(_, event)| event.event_id() != event_id);
        }
        self.entries.remove_if(group, |_, entries| entries.is_empty());
        Ok(())
    }

    async fn failed_event(
        &self,
        group: &Group,
        insertion_id: InsertionId,
    ) -> Result<Option<Arc<dyn Event>>> {
        Ok(self.entries.get(group).and_then(|entries| {
            entries
                .iter()
                .find(|(id, _)| *id == insertion_id)
                .map(|(_, event)| Arc::clone(event))
        }))
    }

    async fn failed_ids(&self, group: &Group) -> Result<Vec<InsertionId>> {
        Ok(self
            .entries
            .get(group)
            .map(|entries| entries.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default())
    }

    async fn remove_all(&self, group: &Group) -> Result<()> {
        if self.entries.remove(group).is_some() {
            warn!(group = %group, "Dropped every dead letter of group");
        }
        Ok(())
    }

    async fn groups_with_failed_events(&self) -> Result<Vec<Group>> {
        let mut groups: Vec<Group> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        groups.sort();
        Ok(groups)
    }

    async fn contain_events(&self) -> Result<bool> {
        Ok(self.entries.iter().any(|entry| !entry.value().is_empty()))
    }
}
