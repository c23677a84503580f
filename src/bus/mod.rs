//! Distributed event bus.
//!
//! This module contains:
//! - [`EventBus`]: the facade used by the mailbox layer to dispatch events and
//!   register listeners
//! - [`naming`]: broker resource names derived from the bus name
//! - Key registrations: ephemeral, per-instance subscriptions for one
//!   registration key (mailbox id, username)
//! - Group registrations: durable subscriptions shared by every instance
//!   hosting the group, with retry and dead-lettering
//!
//! Lifecycle: a bus must be [`started`](EventBus::start) before any other
//! operation. [`stop`](EventBus::stop) cancels every consumer, forgets group
//! registrations and releases broker connections; key registrations survive
//! a restart and are rebound on the next start.

pub mod naming;

mod dispatcher;
mod group;
mod key;
mod local;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerError, ConsumerCancel, ExchangeSpec};
use crate::config::Config;
use crate::dlq::{DeadLetterError, EventDeadLetters, MemoryEventDeadLetters};
use crate::event::Event;
use crate::group::Group;
use crate::listener::EventListener;
use crate::registration::Registration;
use crate::retry::{connection_backoff, RetryBackoffConfiguration, RetryConfigError};
use crate::routing::{RegistrationKey, RoutingKeyConverter, RoutingKeyError};
use crate::serializer::{EventSerializer, SerializationError};

pub use crate::config::DEFAULT_BUS_NAME;
pub use group::DeliveryOutcome;
pub use naming::{EventBusName, NamingStrategy};

use dispatcher::EventDispatcher;
use group::{GroupContext, GroupRegistrationHandler};
use key::KeyRegistrationHandler;
use local::LocalListenerRegistry;

/// Default prefetch and concurrency ceiling of every consumer.
pub const EXECUTION_RATE: u16 = 10;

/// How long a stopping consumer may take to finish in-flight deliveries.
const CONSUMER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Event bus is not started")]
    NotStarted,

    #[error("Group '{0}' is already registered on this bus")]
    GroupAlreadyRegistered(Group),

    #[error("No registration for group '{0}' on this bus")]
    GroupRegistrationNotFound(Group),

    #[error("Invalid retry configuration: {0}")]
    Configuration(#[from] RetryConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    RoutingKey(#[from] RoutingKeyError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
}

// ============================================================================
// Identity
// ============================================================================

/// Identity of one bus instance, unique per process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventBusId(Uuid);

impl EventBusId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EventBusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Consumer tasks
// ============================================================================

/// A spawned consumer loop and the handle that cancels its broker consumer.
pub(crate) struct ConsumerTask {
    cancel: Arc<dyn ConsumerCancel>,
    task: JoinHandle<()>,
}

impl ConsumerTask {
    pub(crate) fn new(cancel: Arc<dyn ConsumerCancel>, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    /// Cancel the consumer, then wait for in-flight deliveries to settle.
    pub(crate) async fn stop(self) {
        if let Err(e) = self.cancel.cancel().await {
            warn!(error = %e, "Failed to cancel consumer");
        }

        let mut task = self.task;
        match tokio::time::timeout(CONSUMER_DRAIN_TIMEOUT, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Consumer task ended abnormally"),
            Err(_) => {
                warn!(
                    timeout = ?CONSUMER_DRAIN_TIMEOUT,
                    "Consumer did not drain in time, aborting"
                );
                task.abort();
            }
        }
    }
}

// ============================================================================
// Event bus
// ============================================================================

/// Builder for [`EventBus`].
pub struct EventBusBuilder {
    broker: Arc<dyn Broker>,
    serializer: Arc<dyn EventSerializer>,
    naming: NamingStrategy,
    converter: RoutingKeyConverter,
    retry: RetryBackoffConfiguration,
    dead_letters: Option<Arc<dyn EventDeadLetters>>,
    execution_rate: u16,
    local_queue_expiry: Duration,
}

impl EventBusBuilder {
    fn new(broker: Arc<dyn Broker>, serializer: Arc<dyn EventSerializer>) -> Self {
        Self {
            broker,
            serializer,
            naming: NamingStrategy::default(),
            converter: RoutingKeyConverter::with_default_factories(),
            retry: RetryBackoffConfiguration::default(),
            dead_letters: None,
            execution_rate: EXECUTION_RATE,
            local_queue_expiry: Duration::from_secs(crate::config::DEFAULT_LOCAL_QUEUE_EXPIRY_SECS),
        }
    }

    pub fn naming(mut self, naming: NamingStrategy) -> Self {
        self.naming = naming;
        self
    }

    pub fn name(self, name: impl Into<String>) -> Self {
        self.naming(NamingStrategy::new(EventBusName::new(name)))
    }

    pub fn routing(mut self, converter: RoutingKeyConverter) -> Self {
        self.converter = converter;
        self
    }

    pub fn retry(mut self, retry: RetryBackoffConfiguration) -> Self {
        self.retry = retry;
        self
    }

    pub fn dead_letters(mut self, dead_letters: Arc<dyn EventDeadLetters>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    /// Prefetch and concurrency ceiling per consumer. Zero is raised to one.
    pub fn execution_rate(mut self, execution_rate: u16) -> Self {
        self.execution_rate = execution_rate.max(1);
        self
    }

    pub fn local_queue_expiry(mut self, expiry: Duration) -> Self {
        self.local_queue_expiry = expiry;
        self
    }

    /// Apply bus and retry settings from loaded configuration.
    pub fn configure(self, config: &Config) -> Result<Self> {
        let retry = config.retry.to_backoff_configuration()?;
        Ok(self
            .name(config.bus.name.clone())
            .execution_rate(config.bus.execution_rate)
            .local_queue_expiry(config.bus.local_queue_expiry())
            .retry(retry))
    }

    pub fn build(self) -> EventBus {
        let id = EventBusId::random();
        let dead_letters = self
            .dead_letters
            .unwrap_or_else(|| Arc::new(MemoryEventDeadLetters::new()));
        let local = Arc::new(LocalListenerRegistry::new());

        let dispatcher = EventDispatcher::new(
            id,
            self.naming.clone(),
            Arc::clone(&self.broker),
            Arc::clone(&self.serializer),
            self.converter.clone(),
            Arc::clone(&local),
            Arc::clone(&dead_letters),
        );

        let key_handler = Arc::new(KeyRegistrationHandler::new(
            id,
            self.naming.clone(),
            Arc::clone(&self.broker),
            Arc::clone(&self.serializer),
            self.converter,
            local,
            self.execution_rate,
            self.local_queue_expiry,
        ));

        let group_handler = Arc::new(GroupRegistrationHandler::new(GroupContext {
            naming: self.naming.clone(),
            broker: Arc::clone(&self.broker),
            serializer: self.serializer,
            retry: self.retry,
            dead_letters: Arc::clone(&dead_letters),
            execution_rate: self.execution_rate,
        }));

        EventBus {
            id,
            naming: self.naming,
            broker: self.broker,
            dead_letters,
            dispatcher,
            key_handler,
            group_handler,
            started: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        }
    }
}

/// Distributed event bus over a message broker.
///
/// Dispatching runs this process's synchronous key listeners inline, then
/// publishes the event once for groups and once per registration key.
/// Listeners registered in other processes receive it through the broker.
pub struct EventBus {
    id: EventBusId,
    naming: NamingStrategy,
    broker: Arc<dyn Broker>,
    dead_letters: Arc<dyn EventDeadLetters>,
    dispatcher: EventDispatcher,
    key_handler: Arc<KeyRegistrationHandler>,
    group_handler: Arc<GroupRegistrationHandler>,
    started: AtomicBool,
    lifecycle: Mutex<()>,
}

impl EventBus {
    pub fn builder(
        broker: Arc<dyn Broker>,
        serializer: Arc<dyn EventSerializer>,
    ) -> EventBusBuilder {
        EventBusBuilder::new(broker, serializer)
    }

    pub fn id(&self) -> EventBusId {
        self.id
    }

    pub fn naming(&self) -> &NamingStrategy {
        &self.naming
    }

    pub fn dead_letters(&self) -> &Arc<dyn EventDeadLetters> {
        &self.dead_letters
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Declare the main exchange and start consuming the key queue.
    /// Starting a started bus is a no-op.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_started() {
            return Ok(());
        }

        let exchange = &ExchangeSpec::durable_direct(self.naming.exchange());
        (|| async move { self.broker.declare_exchange(exchange).await })
            .retry(connection_backoff())
            .when(BrokerError::is_retryable)
            .notify(|err: &BrokerError, dur: Duration| {
                warn!(error = %err, delay = ?dur, "Broker not reachable, retrying");
            })
            .await?;

        self.key_handler.start().await?;
        self.started.store(true, Ordering::SeqCst);

        info!(
            event_bus_id = %self.id,
            bus_name = %self.naming.name(),
            "Event bus started"
        );
        Ok(())
    }

    /// Stop every consumer and release broker resources. Stopping a stopped
    /// bus is a no-op.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        self.group_handler.stop().await;
        self.key_handler.stop().await;
        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "Failed to close broker");
        }

        info!(event_bus_id = %self.id, "Event bus stopped");
    }

    fn ensure_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(BusError::NotStarted)
        }
    }

    /// Register `listener` for events dispatched with `key`.
    pub async fn register_key(
        &self,
        listener: Arc<dyn EventListener>,
        key: impl Into<RegistrationKey>,
    ) -> Result<Registration> {
        self.ensure_started()?;
        self.key_handler.register(listener, key.into()).await
    }

    /// Register `listener` as the only consumer of `group` in this process.
    pub async fn register_group(
        &self,
        listener: Arc<dyn EventListener>,
        group: Group,
    ) -> Result<Registration> {
        self.ensure_started()?;
        self.group_handler.register(listener, group).await
    }

    /// Deliver `event` to every group and to the listeners of `keys`.
    #[tracing::instrument(
        name = "bus.dispatch",
        skip_all,
        fields(event_id = %event.event_id(), keys = keys.len())
    )]
    pub async fn dispatch(&self, event: Arc<dyn Event>, keys: &[RegistrationKey]) -> Result<()> {
        self.ensure_started()?;
        self.dispatcher.dispatch(event, keys).await
    }

    /// Re-send `event` to `group`, typically one read back from the
    /// dead-letter store. Events stored under the dispatching-failure group
    /// are republished to every group.
    #[tracing::instrument(
        name = "bus.redeliver",
        skip_all,
        fields(event_id = %event.event_id(), group = %group)
    )]
    pub async fn redeliver(&self, group: &Group, event: Arc<dyn Event>) -> Result<()> {
        self.ensure_started()?;
        if event.is_noop() {
            return Ok(());
        }

        if group.is_dispatching_failure() {
            self.dispatcher.redeliver_dispatching_failure(event).await
        } else {
            self.group_handler.redeliver(group, event).await
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("id", &self.id)
            .field("name", self.naming.name())
            .field("started", &self.is_started())
            .finish()
    }
}
