//! Ephemeral key subscriptions.
//!
//! Each bus instance owns one exclusive, auto-deleting queue. Registering the
//! first local listener for a key binds that queue to the key's routing key;
//! unregistering the last one unbinds it. Deliveries are executed against the
//! listeners registered for the delivered key, with no retry: failures are
//! logged and the delivery is acknowledged.
//!
//! Broker bind/unbind calls for one key are serialized through a per-key
//! slot recording whether the binding currently exists, so a register racing
//! an unregister of the same key always ends bound while listeners remain.

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use dashmap::DashMap;
use futures::future::join_all;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::local::LocalListenerRegistry;
use super::naming::NamingStrategy;
use super::{ConsumerTask, EventBusId, Result};
use crate::broker::{
    Binding, Broker, BrokerError, ConsumeOptions, Delivery, QueueSpec, EVENT_BUS_ID_HEADER,
};
use crate::listener::{execute, EventListener, ExecutionMode};
use crate::registration::Registration;
use crate::retry::broker_backoff;
use crate::routing::{RegistrationKey, RoutingKeyConverter, WILDCARD_ROUTING_KEY};
use crate::serializer::EventSerializer;

pub(crate) struct KeyRegistrationHandler {
    id: EventBusId,
    naming: NamingStrategy,
    broker: Arc<dyn Broker>,
    serializer: Arc<dyn EventSerializer>,
    converter: RoutingKeyConverter,
    local: Arc<LocalListenerRegistry<RegistrationKey>>,
    execution_rate: u16,
    queue_expiry: Duration,
    consumer: Mutex<Option<ConsumerTask>>,
    /// Per-key binding state: `true` while the key queue is bound for the key.
    bindings: DashMap<RegistrationKey, Arc<Mutex<bool>>>,
}

impl KeyRegistrationHandler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: EventBusId,
        naming: NamingStrategy,
        broker: Arc<dyn Broker>,
        serializer: Arc<dyn EventSerializer>,
        converter: RoutingKeyConverter,
        local: Arc<LocalListenerRegistry<RegistrationKey>>,
        execution_rate: u16,
        queue_expiry: Duration,
    ) -> Self {
        Self {
            id,
            naming,
            broker,
            serializer,
            converter,
            local,
            execution_rate,
            queue_expiry,
            consumer: Mutex::new(None),
            bindings: DashMap::new(),
        }
    }

    fn queue(&self) -> String {
        self.naming.key_queue(&self.id)
    }

    fn binding(&self, routing_key: impl Into<String>) -> Binding {
        Binding::new(self.queue(), self.naming.exchange(), routing_key)
    }

    /// Declare the private queue and start consuming it.
    pub(crate) async fn start(self: &Arc<Self>) -> Result<()> {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return Ok(());
        }

        let queue = self.queue();
        self.broker
            .declare_queue(&QueueSpec::exclusive(&queue).with_expiry(self.queue_expiry))
            .await?;
        self.broker
            .bind(&self.binding(WILDCARD_ROUTING_KEY))
            .await?;

        // Keys registered before a restart need their bindings back.
        for key in self.local.keys() {
            self.ensure_bound(&key).await?;
        }

        let started = self
            .broker
            .consume(
                &queue,
                ConsumeOptions {
                    prefetch: self.execution_rate,
                    consumer_tag: String::new(),
                },
            )
            .await?;

        let handler = Arc::clone(self);
        let limit = usize::from(self.execution_rate);
        let task = tokio::spawn(started.deliveries.for_each_concurrent(limit, move |delivery| {
            let handler = Arc::clone(&handler);
            async move { handler.handle_delivery(delivery).await }
        }));

        *consumer = Some(ConsumerTask::new(started.cancel, task));
        info!(queue = %queue, event_bus_id = %self.id, "Key registration handler started");
        Ok(())
    }

    /// Cancel the consumer and delete the private queue.
    pub(crate) async fn stop(&self) {
        let Some(consumer) = self.consumer.lock().await.take() else {
            return;
        };
        consumer.stop().await;

        let queue = self.queue();
        if let Err(e) = self.broker.delete_queue(&queue).await {
            warn!(queue = %queue, error = %e, "Failed to delete key queue");
        }
        // Bindings die with the queue.
        let slots: Vec<_> = self.bindings.iter().map(|entry| Arc::clone(entry.value())).collect();
        for slot in slots {
            *slot.lock().await = false;
        }
        info!(queue = %queue, "Key registration handler stopped");
    }

    pub(crate) async fn register(
        self: &Arc<Self>,
        listener: Arc<dyn EventListener>,
        key: RegistrationKey,
    ) -> Result<Registration> {
        let local_registration = self.local.add_listener(key.clone(), listener);

        if let Err(e) = self.ensure_bound(&key).await {
            local_registration.unregister();
            if let Err(release) = self.release_if_unused(&key).await {
                warn!(registration_key = %key, error = %release, "Failed to release key binding");
            }
            return Err(e);
        }

        let handler = Arc::clone(self);
        let local_registration = Arc::new(local_registration);
        Ok(Registration::new(move || {
            let handler = Arc::clone(&handler);
            let local_registration = Arc::clone(&local_registration);
            Box::pin(async move {
                if local_registration.unregister() {
                    handler.release_if_unused(local_registration.key()).await?;
                }
                Ok(())
            })
        }))
    }

    fn slot(&self, key: &RegistrationKey) -> Arc<Mutex<bool>> {
        Arc::clone(
            self.bindings
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(false)))
                .value(),
        )
    }

    /// Bind the key queue for `key` unless it already is.
    async fn ensure_bound(&self, key: &RegistrationKey) -> Result<()> {
        let slot = self.slot(key);
        let mut bound = slot.lock().await;
        if !*bound {
            self.bind_with_retry(key).await?;
            *bound = true;
            debug!(registration_key = %key, "Bound key queue");
        }
        Ok(())
    }

    /// Unbind `key` once no local listener is left for it. The listener set is
    /// checked again under the slot lock: a registration that arrived after
    /// the last unregister keeps the binding.
    async fn release_if_unused(&self, key: &RegistrationKey) -> Result<()> {
        let slot = self.slot(key);
        {
            let mut bound = slot.lock().await;
            if !self.local.listeners(key).is_empty() {
                return Ok(());
            }
            if *bound {
                self.unbind_with_retry(key).await?;
                *bound = false;
                debug!(registration_key = %key, "Unbound key queue");
            }
        }
        drop(slot);

        // Forget the slot when nobody else holds it and it is unbound.
        self.bindings.remove_if(key, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|bound| !*bound)
        });
        Ok(())
    }

    async fn bind_with_retry(&self, key: &RegistrationKey) -> Result<()> {
        let binding = &self.binding(self.converter.encode(key));
        (|| async move { self.broker.bind(binding).await })
            .retry(broker_backoff())
            .when(BrokerError::is_retryable)
            .notify(|err: &BrokerError, dur: Duration| {
                warn!(registration_key = %key, error = %err, delay = ?dur, "Bind failed, retrying");
            })
            .await?;
        Ok(())
    }

    async fn unbind_with_retry(&self, key: &RegistrationKey) -> Result<()> {
        let binding = &self.binding(self.converter.encode(key));
        (|| async move { self.broker.unbind(binding).await })
            .retry(broker_backoff())
            .when(BrokerError::is_retryable)
            .notify(|err: &BrokerError, dur: Duration| {
                warn!(registration_key = %key, error = %err, delay = ?dur, "Unbind failed, retrying");
            })
            .await?;
        Ok(())
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        // Wildcard copies are meant for group queues.
        if delivery.routing_key == WILDCARD_ROUTING_KEY {
            settle(delivery.ack().await);
            return;
        }

        let key = match self.converter.decode(&delivery.routing_key) {
            Ok(key) => key,
            Err(e) => {
                error!(routing_key = %delivery.routing_key, error = %e, "Unable to decode routing key");
                settle(delivery.reject().await);
                return;
            }
        };

        let listeners = self.local.listeners(&key);
        if listeners.is_empty() {
            settle(delivery.ack().await);
            return;
        }

        let event = match self.serializer.from_bytes(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                error!(registration_key = %key, error = %e, "Unable to deserialize event");
                settle(delivery.reject().await);
                return;
            }
        };

        // Synchronous listeners already ran on the dispatch path of this instance.
        let own_id = self.id.to_string();
        let from_self = delivery.header_str(EVENT_BUS_ID_HEADER) == Some(own_id.as_str());

        join_all(
            listeners
                .into_iter()
                .filter(|listener| {
                    !(from_self && listener.execution_mode() == ExecutionMode::Synchronous)
                })
                .filter(|listener| listener.is_handling(event.as_ref()))
                .map(|listener| {
                    let event = &event;
                    let key = &key;
                    async move {
                        if let Err(e) = execute(&listener, event).await {
                            error!(
                                event_id = %event.event_id(),
                                listener = %listener.name(),
                                user = %event.username(),
                                registration_key = %key,
                                error = %e,
                                "Key listener failed"
                            );
                        }
                    }
                }),
        )
        .await;

        settle(delivery.ack().await);
    }
}

fn settle(result: std::result::Result<(), BrokerError>) {
    if let Err(e) = result {
        error!(error = %e, "Failed to settle delivery");
    }
}
