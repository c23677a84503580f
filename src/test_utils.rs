//! Test utilities and mock implementations.
//!
//! Provides a concrete serializable event and instrumented listeners for
//! exercising the bus without a real mailbox layer.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::broker::memory::MemoryBroker;
use crate::broker::{
    Binding, Broker, ConsumeOptions, Consumer, ExchangeSpec, OutboundMessage, QueueSpec,
    Result as BrokerResult,
};
use crate::event::{Event, EventId, Username};
use crate::listener::{EventListener, ExecutionMode, ListenerError};
use crate::serializer::{EventSerializer, JsonEventSerializer};

pub const TEST_USER: &str = "bob@domain.tld";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestEvent {
    pub event_id: EventId,
    pub username: Username,
    #[serde(default)]
    pub noop: bool,
}

impl TestEvent {
    pub fn new(username: &str) -> Self {
        Self {
            event_id: EventId::random(),
            username: Username::of(username),
            noop: false,
        }
    }
}

impl Event for TestEvent {
    fn event_id(&self) -> EventId {
        self.event_id
    }

    fn username(&self) -> &Username {
        &self.username
    }

    fn is_noop(&self) -> bool {
        self.noop
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn test_event() -> Arc<dyn Event> {
    Arc::new(TestEvent::new(TEST_USER))
}

pub fn noop_event() -> Arc<dyn Event> {
    Arc::new(TestEvent {
        noop: true,
        ..TestEvent::new(TEST_USER)
    })
}

pub fn test_serializer() -> Arc<dyn EventSerializer> {
    Arc::new(JsonEventSerializer::<TestEvent>::new())
}

/// Listener recording every event it receives.
pub struct CountingListener {
    mode: ExecutionMode,
    received: Mutex<Vec<EventId>>,
}

impl CountingListener {
    pub fn new() -> Self {
        Self {
            mode: ExecutionMode::Synchronous,
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn asynchronous() -> Self {
        Self {
            mode: ExecutionMode::Asynchronous,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn received(&self) -> Vec<EventId> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventListener for CountingListener {
    fn name(&self) -> &str {
        "counting"
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    async fn handle(&self, event: Arc<dyn Event>) -> Result<(), ListenerError> {
        self.received.lock().unwrap().push(event.event_id());
        Ok(())
    }
}

/// Listener failing its first `failures` calls, then succeeding.
pub struct FailingListener {
    failures: usize,
    calls: AtomicUsize,
}

impl FailingListener {
    pub fn always() -> Self {
        Self::times(usize::MAX)
    }

    pub fn times(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventListener for FailingListener {
    fn name(&self) -> &str {
        "failing"
    }

    async fn handle(&self, _event: Arc<dyn Event>) -> Result<(), ListenerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(ListenerError::Failed(format!("failure #{}", call + 1)))
        } else {
            Ok(())
        }
    }
}

/// Broker wrapping a [`MemoryBroker`] that records every published message
/// and can slow down unbinding.
pub struct InstrumentedBroker {
    inner: MemoryBroker,
    unbind_delay: Duration,
    published: Mutex<Vec<OutboundMessage>>,
}

impl InstrumentedBroker {
    pub fn new(inner: MemoryBroker) -> Self {
        Self {
            inner,
            unbind_delay: Duration::ZERO,
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn with_unbind_delay(mut self, delay: Duration) -> Self {
        self.unbind_delay = delay;
        self
    }

    /// Messages published to `exchange`, in publish order.
    pub fn published_to(&self, exchange: &str) -> Vec<OutboundMessage> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|message| message.exchange == exchange)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Broker for InstrumentedBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()> {
        self.inner.declare_exchange(spec).await
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()> {
        self.inner.declare_queue(spec).await
    }

    async fn delete_queue(&self, name: &str) -> BrokerResult<()> {
        self.inner.delete_queue(name).await
    }

    async fn bind(&self, binding: &Binding) -> BrokerResult<()> {
        self.inner.bind(binding).await
    }

    async fn unbind(&self, binding: &Binding) -> BrokerResult<()> {
        tokio::time::sleep(self.unbind_delay).await;
        self.inner.unbind(binding).await
    }

    async fn publish(&self, message: &OutboundMessage) -> BrokerResult<()> {
        let result = self.inner.publish(message).await;
        if result.is_ok() {
            self.published.lock().unwrap().push(message.clone());
        }
        result
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> BrokerResult<Consumer> {
        self.inner.consume(queue, options).await
    }

    async fn close(&self) -> BrokerResult<()> {
        self.inner.close().await
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
