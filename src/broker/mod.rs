//! Broker wire abstraction.
//!
//! The bus talks to its message broker through the [`Broker`] trait, which
//! models the subset of AMQP 0-9-1 it relies on: durable direct exchanges,
//! queues with dead-letter and expiry arguments, bindings, publishing with
//! headers, and manually acknowledged consumption with a prefetch window.
//!
//! Implementations:
//! - [`memory::MemoryBroker`]: in-process broker for standalone mode and tests
//! - `amqp::AmqpBroker` (feature `amqp`): RabbitMQ over `lapin`

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::{MessagingConfig, MessagingType};

/// Header carrying the id of the bus instance that published a message.
pub const EVENT_BUS_ID_HEADER: &str = "eventBusId";

/// Header carrying how many times a group delivery was retried.
pub const RETRY_COUNT_HEADER: &str = "retry-count";

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur talking to the broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Declaration failed: {0}")]
    Declare(String),

    #[error("Binding failed: {0}")]
    Bind(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Timed out after {0:?} waiting for a broker channel")]
    PoolTimeout(Duration),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl BrokerError {
    /// Whether retrying the operation may succeed.
    ///
    /// Retryable: connection and channel faults, pool exhaustion, publish and
    /// bind failures. Non-retryable: missing resources and declaration
    /// mismatches.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::Channel(_)
                | Self::Bind(_)
                | Self::Publish(_)
                | Self::PoolTimeout(_)
        )
    }
}

/// A message header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            Self::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Str(value) => value.parse().ok(),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// A durable direct exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn durable_direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Exchange receiving messages rejected without requeue.
    pub dead_letter_exchange: Option<String>,
    /// Delete the queue after it has been unused this long.
    pub expires: Option<Duration>,
}

impl QueueSpec {
    /// Durable, shared, never auto-deleted queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter_exchange: None,
            expires: None,
        }
    }

    /// Exclusive, auto-deleted queue private to one connection.
    pub fn exclusive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: true,
            auto_delete: true,
            dead_letter_exchange: None,
            expires: None,
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn with_expiry(mut self, expires: Duration) -> Self {
        self.expires = Some(expires);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl Binding {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// A message to publish.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
    pub body: Arc<[u8]>,
}

#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries outstanding on this consumer.
    pub prefetch: u16,
    pub consumer_tag: String,
}

/// Settles a single delivery.
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Reject without requeue. The broker dead-letters the message when the
    /// queue has a dead-letter exchange.
    async fn reject(self: Box<Self>) -> Result<()>;
}

/// A message received from a queue, awaiting settlement.
pub struct Delivery {
    pub routing_key: String,
    pub headers: Headers,
    pub body: Arc<[u8]>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        routing_key: String,
        headers: Headers,
        body: Arc<[u8]>,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            routing_key,
            headers,
            body,
            acker,
        }
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(HeaderValue::as_str)
    }

    pub fn header_int(&self, name: &str) -> Option<i64> {
        self.headers.get(name).and_then(HeaderValue::as_int)
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(self) -> Result<()> {
        self.acker.reject().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Stops a running consumer. Deliveries already handed out may still be
/// settled; no new ones are produced.
#[async_trait]
pub trait ConsumerCancel: Send + Sync {
    async fn cancel(&self) -> Result<()>;
}

/// A live consumer: its delivery stream plus a cancel handle.
pub struct Consumer {
    pub deliveries: BoxStream<'static, Delivery>,
    pub cancel: Arc<dyn ConsumerCancel>,
}

/// Message broker operations used by the bus.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    async fn delete_queue(&self, name: &str) -> Result<()>;

    async fn bind(&self, binding: &Binding) -> Result<()>;

    async fn unbind(&self, binding: &Binding) -> Result<()>;

    async fn publish(&self, message: &OutboundMessage) -> Result<()>;

    /// Start consuming `queue` with manual acknowledgement.
    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer>;

    /// Release connections and pooled channels. The broker may be reused
    /// afterwards; connections are re-established lazily.
    async fn close(&self) -> Result<()>;
}

/// Build the broker selected by `config`.
pub fn from_config(config: &MessagingConfig) -> Result<Arc<dyn Broker>> {
    match config.messaging_type {
        MessagingType::Memory => {
            tracing::info!(messaging_type = "memory", "Using in-process broker");
            Ok(Arc::new(memory::MemoryBroker::new()))
        }
        #[cfg(feature = "amqp")]
        MessagingType::Amqp => {
            tracing::info!(messaging_type = "amqp", url = %config.amqp.url, "Using AMQP broker");
            Ok(Arc::new(amqp::AmqpBroker::new(&config.amqp)?))
        }
        #[cfg(not(feature = "amqp"))]
        MessagingType::Amqp => Err(BrokerError::Connection(
            "AMQP messaging requires the 'amqp' feature".to_string(),
        )),
    }
}
