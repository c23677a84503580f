//! AMQP (RabbitMQ) broker implementation.
//!
//! One cached connection (a single-slot `deadpool-lapin` pool) is shared by
//! every channel. Publishing, declarations and bindings go through the
//! bounded [`ChannelPool`]; each consumer gets a dedicated channel carrying
//! its prefetch window, closed once the consumer's stream is dropped.

mod pool;

pub use pool::{ChannelManager, ChannelPool, PooledChannel};

use std::sync::Arc;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool};
use futures::{future, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, error, info};

use super::{
    Acker, Binding, Broker, BrokerError, ConsumeOptions, Consumer, ConsumerCancel, Delivery,
    ExchangeSpec, HeaderValue, Headers, OutboundMessage, QueueSpec, Result,
};
use crate::config::AmqpConfig;

const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
const EXPIRES_ARG: &str = "x-expires";

/// RabbitMQ-backed [`Broker`].
pub struct AmqpBroker {
    url: String,
    connections: Pool,
    channels: ChannelPool,
}

impl AmqpBroker {
    /// Create a broker for `config`. No connection is opened until the first
    /// operation needs one.
    pub fn new(config: &AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), ConnectionProperties::default());
        let connections = Pool::builder(manager)
            .max_size(1)
            .build()
            .map_err(|e| BrokerError::Connection(format!("Failed to create pool: {}", e)))?;

        let channels = ChannelPool::new(
            connections.clone(),
            config.channel_pool_size,
            config.borrow_timeout(),
        )?;

        Ok(Self {
            url: config.url.clone(),
            connections,
            channels,
        })
    }

    /// Open a channel outside the pool, for a long-lived consumer.
    async fn dedicated_channel(&self) -> Result<Channel> {
        let connection = self
            .connections
            .get()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to get connection: {}", e)))?;

        connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to create channel: {}", e)))
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        let name = spec.name.clone();
        let durable = spec.durable;
        self.channels
            .with_channel(|channel| async move {
                channel
                    .exchange_declare(
                        &name,
                        ExchangeKind::Direct,
                        ExchangeDeclareOptions {
                            durable,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| {
                        BrokerError::Declare(format!("Failed to declare exchange {}: {}", name, e))
                    })
            })
            .await?;

        info!(exchange = %spec.name, url = %self.url, "Declared exchange");
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let spec = spec.clone();
        self.channels
            .with_channel(|channel| async move {
                channel
                    .queue_declare(
                        &spec.name,
                        QueueDeclareOptions {
                            durable: spec.durable,
                            exclusive: spec.exclusive,
                            auto_delete: spec.auto_delete,
                            ..Default::default()
                        },
                        queue_arguments(&spec),
                    )
                    .await
                    .map(|_| ())
                    .map_err(|e| {
                        BrokerError::Declare(format!("Failed to declare queue {}: {}", spec.name, e))
                    })
            })
            .await
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.channels
            .with_channel(|channel| async move {
                channel
                    .queue_delete(&name, QueueDeleteOptions::default())
                    .await
                    .map(|_| ())
                    .map_err(|e| {
                        BrokerError::Declare(format!("Failed to delete queue {}: {}", name, e))
                    })
            })
            .await
    }

    async fn bind(&self, binding: &Binding) -> Result<()> {
        let binding = binding.clone();
        self.channels
            .with_channel(|channel| async move {
                channel
                    .queue_bind(
                        &binding.queue,
                        &binding.exchange,
                        &binding.routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| BrokerError::Bind(format!("Failed to bind {:?}: {}", binding, e)))
            })
            .await
    }

    async fn unbind(&self, binding: &Binding) -> Result<()> {
        let binding = binding.clone();
        self.channels
            .with_channel(|channel| async move {
                channel
                    .queue_unbind(
                        &binding.queue,
                        &binding.exchange,
                        &binding.routing_key,
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| {
                        BrokerError::Bind(format!("Failed to unbind {:?}: {}", binding, e))
                    })
            })
            .await
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        let message = message.clone();
        self.channels
            .with_channel(|channel| async move {
                let properties = BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2) // persistent
                    .with_headers(to_field_table(&message.headers));

                let confirmation = channel
                    .basic_publish(
                        &message.exchange,
                        &message.routing_key,
                        BasicPublishOptions::default(),
                        &message.body,
                        properties,
                    )
                    .await
                    .map_err(|e| BrokerError::Publish(format!("Failed to publish: {}", e)))?
                    .await
                    .map_err(|e| {
                        BrokerError::Publish(format!("Publish confirmation failed: {}", e))
                    })?;

                if confirmation.is_nack() {
                    return Err(BrokerError::Publish("Broker nacked publish".to_string()));
                }

                debug!(
                    exchange = %message.exchange,
                    routing_key = %message.routing_key,
                    "Published message"
                );
                Ok(())
            })
            .await
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer> {
        let channel = self.dedicated_channel().await?;

        channel
            .basic_qos(options.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to set prefetch: {}", e)))?;

        let consumer = channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to start consumer: {}", e)))?;

        let tag = consumer.tag().as_str().to_string();
        info!(queue = %queue, consumer_tag = %tag, "Consumer connected");

        let closer = ChannelCloser(channel.clone());
        let queue_name = queue.to_string();
        let deliveries = consumer
            .take_while(move |item| {
                if let Err(e) = item {
                    error!(queue = %queue_name, error = %e, "Consumer delivery error");
                }
                future::ready(item.is_ok())
            })
            .filter_map(|item| future::ready(item.ok()))
            .map(move |delivery| {
                let _channel = &closer.0;
                from_lapin_delivery(delivery)
            })
            .boxed();

        Ok(Consumer {
            deliveries,
            cancel: Arc::new(AmqpConsumerCancel { channel, tag }),
        })
    }

    async fn close(&self) -> Result<()> {
        if self.connections.status().size == 0 {
            return Ok(());
        }

        let connection = self
            .connections
            .get()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to get connection: {}", e)))?;
        if connection.status().connected() {
            connection
                .close(200, "closing")
                .await
                .map_err(|e| BrokerError::Connection(format!("Failed to close: {}", e)))?;
        }
        info!(url = %self.url, "Closed AMQP connection");
        Ok(())
    }
}

/// Closes a consumer channel once its delivery stream is dropped.
struct ChannelCloser(Channel);

impl Drop for ChannelCloser {
    fn drop(&mut self) {
        let channel = self.0.clone();
        if !channel.status().connected() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = channel.close(200, "consumer stopped").await {
                    debug!(error = %e, "Failed to close consumer channel");
                }
            });
        }
    }
}

struct AmqpConsumerCancel {
    channel: Channel,
    tag: String,
}

#[async_trait]
impl ConsumerCancel for AmqpConsumerCancel {
    async fn cancel(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .basic_cancel(&self.tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to cancel {}: {}", self.tag, e)))
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn reject(self: Box<Self>) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(exchange) = &spec.dead_letter_exchange {
        arguments.insert(
            DEAD_LETTER_EXCHANGE_ARG.into(),
            AMQPValue::LongString(exchange.clone().into()),
        );
    }
    if let Some(expires) = spec.expires {
        arguments.insert(
            EXPIRES_ARG.into(),
            AMQPValue::LongLongInt(i64::try_from(expires.as_millis()).unwrap_or(i64::MAX)),
        );
    }
    arguments
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers {
        let value = match value {
            HeaderValue::Str(s) => AMQPValue::LongString(s.clone().into()),
            HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
        };
        table.insert(ShortString::from(name.clone()), value);
    }
    table
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(name, value)| {
            let value = match value {
                AMQPValue::LongString(s) => {
                    HeaderValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned())
                }
                AMQPValue::ShortString(s) => HeaderValue::Str(s.as_str().to_string()),
                AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
                AMQPValue::LongInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::ShortInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::ShortShortInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::LongUInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::ShortUInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::ShortShortUInt(i) => HeaderValue::Int(i64::from(*i)),
                _ => return None,
            };
            Some((name.as_str().to_string(), value))
        })
        .collect()
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();

    Delivery::new(
        delivery.routing_key.as_str().to_string(),
        headers,
        Arc::from(delivery.data),
        Box::new(AmqpAcker(delivery.acker)),
    )
}
