//! Durable group subscriptions with retry and dead-lettering.
//!
//! Every process hosting a group consumes the same durable work queue
//! (`<bus>-workQueue-<group>`), bound to the main exchange with the wildcard
//! routing key, so instances compete for the group's events. A failing
//! listener gets the event back through the group's retry exchange with an
//! incremented `retry-count` header, spaced by [`WaitDelayGenerator`], until
//! the retry budget runs out and the event lands in the dead-letter store.
//!
//! Undecodable deliveries are rejected without requeue; the broker routes
//! them to the bus-wide dead-letter queue.

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::naming::NamingStrategy;
use super::{BusError, ConsumerTask, Result};
use crate::broker::{
    Binding, Broker, BrokerError, ConsumeOptions, Delivery, ExchangeSpec, Headers, HeaderValue,
    OutboundMessage, QueueSpec, RETRY_COUNT_HEADER,
};
use crate::dlq::EventDeadLetters;
use crate::event::Event;
use crate::group::Group;
use crate::listener::{execute, EventListener, ListenerError};
use crate::registration::Registration;
use crate::retry::{broker_backoff, RetryBackoffConfiguration, RetryDecision, WaitDelayGenerator};
use crate::routing::WILDCARD_ROUTING_KEY;
use crate::serializer::EventSerializer;

/// Result of running one group delivery through its listener.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// The listener handled the event.
    Handled,
    /// The listener is not interested in the event.
    Skipped,
    /// The listener failed; the event goes to retry or dead letters.
    RetryableFailure {
        event: Arc<dyn Event>,
        error: ListenerError,
    },
    /// The delivery cannot be processed at all.
    FatalFailure(String),
}

/// Collaborators shared by every group registration of one bus.
pub(crate) struct GroupContext {
    pub(crate) naming: NamingStrategy,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) serializer: Arc<dyn EventSerializer>,
    pub(crate) retry: RetryBackoffConfiguration,
    pub(crate) dead_letters: Arc<dyn EventDeadLetters>,
    pub(crate) execution_rate: u16,
}

pub(crate) struct GroupRegistrationHandler {
    context: Arc<GroupContext>,
    registrations: DashMap<Group, Arc<GroupRegistration>>,
}

impl GroupRegistrationHandler {
    pub(crate) fn new(context: GroupContext) -> Self {
        Self {
            context: Arc::new(context),
            registrations: DashMap::new(),
        }
    }

    /// Register `listener` for `group`. Fails fast if the group already has a
    /// live registration in this process.
    pub(crate) async fn register(
        self: &Arc<Self>,
        listener: Arc<dyn EventListener>,
        group: Group,
    ) -> Result<Registration> {
        let registration = Arc::new(GroupRegistration::new(
            group.clone(),
            listener,
            Arc::clone(&self.context),
        ));

        match self.registrations.entry(group.clone()) {
            Entry::Occupied(_) => return Err(BusError::GroupAlreadyRegistered(group)),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&registration));
            }
        }

        if let Err(e) = registration.start().await {
            self.registrations
                .remove_if(&group, |_, r| Arc::ptr_eq(r, &registration));
            return Err(e);
        }

        let handler = Arc::clone(self);
        Ok(Registration::new(move || {
            let handler = Arc::clone(&handler);
            let registration = Arc::clone(&registration);
            Box::pin(async move {
                handler.unregister(&registration).await;
                Ok(())
            })
        }))
    }

    async fn unregister(&self, registration: &Arc<GroupRegistration>) {
        let removed = self
            .registrations
            .remove_if(&registration.group, |_, r| Arc::ptr_eq(r, registration));
        if removed.is_some() {
            registration.stop().await;
        }
    }

    pub(crate) async fn redeliver(&self, group: &Group, event: Arc<dyn Event>) -> Result<()> {
        let registration = self
            .registrations
            .get(group)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BusError::GroupRegistrationNotFound(group.clone()))?;
        registration.redeliver(event).await
    }

    /// Stop and forget every group registration.
    pub(crate) async fn stop(&self) {
        let groups: Vec<Group> = self
            .registrations
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for group in groups {
            if let Some((_, registration)) = self.registrations.remove(&group) {
                registration.stop().await;
            }
        }
    }
}

/// One live group subscription in this process.
pub(crate) struct GroupRegistration {
    group: Group,
    listener: Arc<dyn EventListener>,
    context: Arc<GroupContext>,
    delays: WaitDelayGenerator,
    consumer: Mutex<Option<ConsumerTask>>,
}

impl GroupRegistration {
    fn new(group: Group, listener: Arc<dyn EventListener>, context: Arc<GroupContext>) -> Self {
        let delays = WaitDelayGenerator::new(context.retry);
        Self {
            group,
            listener,
            context,
            delays,
            consumer: Mutex::new(None),
        }
    }

    fn work_queue(&self) -> String {
        self.context.naming.work_queue(&self.group)
    }

    fn retry_exchange(&self) -> String {
        self.context.naming.retry_exchange(&self.group)
    }

    async fn start(self: &Arc<Self>) -> Result<()> {
        let naming = &self.context.naming;
        let broker = &self.context.broker;
        let queue = self.work_queue();
        let retry_exchange = self.retry_exchange();
        let dead_letter_exchange = naming.dead_letter_exchange();
        let dead_letter_queue = naming.dead_letter_queue();

        broker
            .declare_exchange(&ExchangeSpec::durable_direct(&dead_letter_exchange))
            .await?;
        broker
            .declare_queue(&QueueSpec::durable(&dead_letter_queue))
            .await?;
        broker
            .bind(&Binding::new(
                &dead_letter_queue,
                &dead_letter_exchange,
                WILDCARD_ROUTING_KEY,
            ))
            .await?;

        broker
            .declare_queue(
                &QueueSpec::durable(&queue).with_dead_letter_exchange(&dead_letter_exchange),
            )
            .await?;
        broker
            .bind(&Binding::new(&queue, naming.exchange(), WILDCARD_ROUTING_KEY))
            .await?;
        broker
            .declare_exchange(&ExchangeSpec::durable_direct(&retry_exchange))
            .await?;
        broker
            .bind(&Binding::new(&queue, &retry_exchange, WILDCARD_ROUTING_KEY))
            .await?;

        let started = broker
            .consume(
                &queue,
                ConsumeOptions {
                    prefetch: self.context.execution_rate,
                    consumer_tag: String::new(),
                },
            )
            .await?;

        let registration = Arc::clone(self);
        let limit = usize::from(self.context.execution_rate);
        let task = tokio::spawn(started.deliveries.for_each_concurrent(limit, move |delivery| {
            let registration = Arc::clone(&registration);
            async move { registration.handle_delivery(delivery).await }
        }));

        *self.consumer.lock().await = Some(ConsumerTask::new(started.cancel, task));
        info!(group = %self.group, queue = %queue, "Group registration started");
        Ok(())
    }

    async fn stop(&self) {
        if let Some(consumer) = self.consumer.lock().await.take() {
            consumer.stop().await;
            info!(group = %self.group, "Group registration stopped");
        }
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let retry_count = delivery
            .header_int(RETRY_COUNT_HEADER)
            .and_then(|count| u32::try_from(count).ok())
            .unwrap_or(0);

        self.delays.delay_if_have_to(retry_count).await;

        let body = Arc::clone(&delivery.body);
        let result = match self.process(&body).await {
            DeliveryOutcome::Handled | DeliveryOutcome::Skipped => delivery.ack().await,
            DeliveryOutcome::RetryableFailure { event, error } => {
                error!(
                    event_id = %event.event_id(),
                    listener = %self.listener.name(),
                    user = %event.username(),
                    group = %self.group,
                    retry_count,
                    error = %error,
                    "Group listener failed"
                );
                match self.record_failure(event, retry_count).await {
                    Ok(()) => delivery.ack().await,
                    Err(e) => {
                        error!(group = %self.group, error = %e, "Unable to record failed delivery");
                        delivery.reject().await
                    }
                }
            }
            DeliveryOutcome::FatalFailure(reason) => {
                error!(group = %self.group, reason = %reason, "Unable to process delivery");
                delivery.reject().await
            }
        };

        if let Err(e) = result {
            error!(group = %self.group, error = %e, "Failed to settle delivery");
        }
    }

    async fn process(&self, body: &[u8]) -> DeliveryOutcome {
        let event = match self.context.serializer.from_bytes(body) {
            Ok(event) => event,
            Err(e) => return DeliveryOutcome::FatalFailure(e.to_string()),
        };

        if !self.listener.is_handling(event.as_ref()) {
            return DeliveryOutcome::Skipped;
        }

        match execute(&self.listener, &event).await {
            Ok(()) => DeliveryOutcome::Handled,
            Err(error) => DeliveryOutcome::RetryableFailure { event, error },
        }
    }

    /// Durably record a failed attempt: retry, or dead-letter once the retry
    /// budget is spent. A retry that cannot be published is dead-lettered.
    async fn record_failure(&self, event: Arc<dyn Event>, retry_count: u32) -> Result<()> {
        match RetryDecision::after_failure(retry_count, self.context.retry.max_retries()) {
            RetryDecision::Retry { retry_count } => {
                match self.publish_retry(event.as_ref(), retry_count).await {
                    Ok(()) => {
                        debug!(
                            event_id = %event.event_id(),
                            group = %self.group,
                            retry_count,
                            "Scheduled retry"
                        );
                        Ok(())
                    }
                    Err(e) => {
                        warn!(
                            event_id = %event.event_id(),
                            group = %self.group,
                            error = %e,
                            "Retry publish failed, storing dead letter"
                        );
                        self.store_dead_letter(event).await
                    }
                }
            }
            RetryDecision::DeadLetter => self.store_dead_letter(event).await,
        }
    }

    async fn store_dead_letter(&self, event: Arc<dyn Event>) -> Result<()> {
        let event_id = event.event_id();
        let insertion_id = self.context.dead_letters.store(&self.group, event).await?;
        warn!(
            event_id = %event_id,
            group = %self.group,
            insertion_id = %insertion_id,
            "Retries exhausted, stored dead letter"
        );
        Ok(())
    }

    async fn redeliver(&self, event: Arc<dyn Event>) -> Result<()> {
        self.publish_retry(event.as_ref(), 0).await
    }

    async fn publish_retry(&self, event: &dyn Event, retry_count: u32) -> Result<()> {
        let mut headers = Headers::new();
        headers.insert(
            RETRY_COUNT_HEADER.to_string(),
            HeaderValue::Int(i64::from(retry_count)),
        );
        let message = &OutboundMessage {
            exchange: self.retry_exchange(),
            routing_key: WILDCARD_ROUTING_KEY.to_string(),
            headers,
            body: Arc::from(self.context.serializer.to_bytes(event)?),
        };

        (|| async move { self.context.broker.publish(message).await })
            .retry(broker_backoff())
            .when(BrokerError::is_retryable)
            .notify(|err: &BrokerError, dur: Duration| {
                warn!(group = %self.group, error = %err, delay = ?dur, "Retry publish failed, retrying");
            })
            .await?;
        Ok(())
    }
}
