//! Event dispatcher: the single publishing entry point.
//!
//! A dispatch runs same-process synchronous listeners inline, then
//! serializes the event once and publishes one copy per routing key: the
//! wildcard copy feeds every group work queue, each keyed copy feeds the key
//! queues of instances subscribed to that key.

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use futures::future::{join_all, try_join_all};
use tracing::{debug, error, warn};

use super::local::LocalListenerRegistry;
use super::naming::NamingStrategy;
use super::{EventBusId, Result};
use crate::broker::{Broker, BrokerError, Headers, HeaderValue, OutboundMessage, EVENT_BUS_ID_HEADER};
use crate::dlq::EventDeadLetters;
use crate::event::Event;
use crate::listener::{execute, same_listener, EventListener, ExecutionMode};
use crate::retry::broker_backoff;
use crate::routing::{RegistrationKey, RoutingKeyConverter, WILDCARD_ROUTING_KEY};
use crate::serializer::EventSerializer;

pub(crate) struct EventDispatcher {
    id: EventBusId,
    naming: NamingStrategy,
    broker: Arc<dyn Broker>,
    serializer: Arc<dyn EventSerializer>,
    converter: RoutingKeyConverter,
    local: Arc<LocalListenerRegistry<RegistrationKey>>,
    dead_letters: Arc<dyn EventDeadLetters>,
}

impl EventDispatcher {
    pub(crate) fn new(
        id: EventBusId,
        naming: NamingStrategy,
        broker: Arc<dyn Broker>,
        serializer: Arc<dyn EventSerializer>,
        converter: RoutingKeyConverter,
        local: Arc<LocalListenerRegistry<RegistrationKey>>,
        dead_letters: Arc<dyn EventDeadLetters>,
    ) -> Self {
        Self {
            id,
            naming,
            broker,
            serializer,
            converter,
            local,
            dead_letters,
        }
    }

    pub(crate) async fn dispatch(
        &self,
        event: Arc<dyn Event>,
        keys: &[RegistrationKey],
    ) -> Result<()> {
        if event.is_noop() {
            return Ok(());
        }

        self.dispatch_to_local_listeners(&event, keys).await;

        let body: Arc<[u8]> = Arc::from(self.serializer.to_bytes(event.as_ref())?);
        let routing_keys: Vec<String> = std::iter::once(WILDCARD_ROUTING_KEY.to_string())
            .chain(keys.iter().map(|key| self.converter.encode(key)))
            .collect();

        if let Err(e) = self.publish_all(&body, &routing_keys).await {
            error!(
                event_id = %event.event_id(),
                user = %event.username(),
                error = %e,
                "Failed to publish event, storing it as a dispatching failure"
            );
            self.store_dispatching_failure(event).await;
            return Err(e.into());
        }

        debug!(
            event_id = %event.event_id(),
            copies = routing_keys.len(),
            "Dispatched event"
        );
        Ok(())
    }

    /// Republish a previously failed dispatch to every group.
    pub(crate) async fn redeliver_dispatching_failure(&self, event: Arc<dyn Event>) -> Result<()> {
        let body: Arc<[u8]> = Arc::from(self.serializer.to_bytes(event.as_ref())?);

        if let Err(e) = self
            .publish_all(&body, &[WILDCARD_ROUTING_KEY.to_string()])
            .await
        {
            error!(
                event_id = %event.event_id(),
                error = %e,
                "Failed to redeliver dispatching failure"
            );
            self.store_dispatching_failure(event).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Run matching local synchronous listeners, each at most once.
    async fn dispatch_to_local_listeners(&self, event: &Arc<dyn Event>, keys: &[RegistrationKey]) {
        let mut targets: Vec<(Arc<dyn EventListener>, &RegistrationKey)> = Vec::new();
        for key in keys {
            for listener in self.local.listeners(key) {
                if listener.execution_mode() == ExecutionMode::Synchronous
                    && !targets.iter().any(|(l, _)| same_listener(l, &listener))
                {
                    targets.push((listener, key));
                }
            }
        }

        join_all(
            targets
                .into_iter()
                .filter(|(listener, _)| listener.is_handling(event.as_ref()))
                .map(|(listener, key)| async move {
                    if let Err(e) = execute(&listener, event).await {
                        error!(
                            event_id = %event.event_id(),
                            listener = %listener.name(),
                            user = %event.username(),
                            registration_key = %key,
                            error = %e,
                            "Local listener failed"
                        );
                    }
                }),
        )
        .await;
    }

    async fn publish_all(
        &self,
        body: &Arc<[u8]>,
        routing_keys: &[String],
    ) -> std::result::Result<(), BrokerError> {
        let exchange = self.naming.exchange();
        let mut headers = Headers::new();
        headers.insert(
            EVENT_BUS_ID_HEADER.to_string(),
            HeaderValue::Str(self.id.to_string()),
        );

        try_join_all(routing_keys.iter().map(|routing_key| {
            let message = OutboundMessage {
                exchange: exchange.clone(),
                routing_key: routing_key.clone(),
                headers: headers.clone(),
                body: Arc::clone(body),
            };
            async move {
                let message = &message;
                (|| async move { self.broker.publish(message).await })
                    .retry(broker_backoff())
                    .when(BrokerError::is_retryable)
                    .notify(|err: &BrokerError, dur: Duration| {
                        warn!(
                            routing_key = %message.routing_key,
                            error = %err,
                            delay = ?dur,
                            "Publish failed, retrying"
                        );
                    })
                    .await
            }
        }))
        .await?;
        Ok(())
    }

    async fn store_dispatching_failure(&self, event: Arc<dyn Event>) {
        let group = self.naming.dispatching_failure_group();
        let event_id = event.event_id();
        if let Err(e) = self.dead_letters.store(&group, event).await {
            error!(
                event_id = %event_id,
                group = %group,
                error = %e,
                "Failed to store dispatching failure"
            );
        }
    }
}
