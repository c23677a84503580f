//! Shared utilities for integration tests.
//!
//! Provides a mailbox-shaped event family, instrumented listeners and
//! polling helpers.
#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mailbus::serializer::{EventSerializer, JsonEventSerializer};
use mailbus::{Event, EventId, EventListener, ExecutionMode, ListenerError, Username};

pub const USER: &str = "bob@domain.tld";

/// Events as a mailbox layer would model them: one serde-tagged enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MailboxEvent {
    MessageAdded {
        event_id: EventId,
        username: Username,
        mailbox_id: String,
        uids: Vec<u32>,
    },
    FlagsUpdated {
        event_id: EventId,
        username: Username,
        mailbox_id: String,
        flags: Vec<String>,
    },
}

impl MailboxEvent {
    pub fn added(mailbox_id: &str) -> Arc<dyn Event> {
        Arc::new(Self::MessageAdded {
            event_id: EventId::random(),
            username: Username::of(USER),
            mailbox_id: mailbox_id.to_string(),
            uids: vec![1],
        })
    }

    /// A flags update that changes nothing.
    pub fn empty_flags_update(mailbox_id: &str) -> Arc<dyn Event> {
        Arc::new(Self::FlagsUpdated {
            event_id: EventId::random(),
            username: Username::of(USER),
            mailbox_id: mailbox_id.to_string(),
            flags: Vec::new(),
        })
    }
}

impl Event for MailboxEvent {
    fn event_id(&self) -> EventId {
        match self {
            Self::MessageAdded { event_id, .. } | Self::FlagsUpdated { event_id, .. } => *event_id,
        }
    }

    fn username(&self) -> &Username {
        match self {
            Self::MessageAdded { username, .. } | Self::FlagsUpdated { username, .. } => username,
        }
    }

    fn is_noop(&self) -> bool {
        matches!(self, Self::FlagsUpdated { flags, .. } if flags.is_empty())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn serializer() -> Arc<dyn EventSerializer> {
    Arc::new(JsonEventSerializer::<MailboxEvent>::new())
}

/// Listener recording the ids of the events it receives.
pub struct RecordingListener {
    mode: ExecutionMode,
    received: Mutex<Vec<EventId>>,
}

impl RecordingListener {
    pub fn synchronous() -> Arc<Self> {
        Arc::new(Self {
            mode: ExecutionMode::Synchronous,
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn asynchronous() -> Arc<Self> {
        Arc::new(Self {
            mode: ExecutionMode::Asynchronous,
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn received(&self) -> Vec<EventId> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventListener for RecordingListener {
    fn name(&self) -> &str {
        "recording"
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    async fn handle(&self, event: Arc<dyn Event>) -> Result<(), ListenerError> {
        self.received.lock().unwrap().push(event.event_id());
        Ok(())
    }
}

/// Listener that always fails.
#[derive(Default)]
pub struct BrokenListener {
    calls: AtomicUsize,
}

impl BrokenListener {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventListener for BrokenListener {
    fn name(&self) -> &str {
        "broken"
    }

    async fn handle(&self, _event: Arc<dyn Event>) -> Result<(), ListenerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ListenerError::Failed("index unavailable".to_string()))
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
