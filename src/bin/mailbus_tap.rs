//! mailbus-tap: logging group listener
//!
//! Joins a bus as a group consumer and logs every event it receives.
//! Useful for debugging and monitoring event flow.
//!
//! ## Configuration
//! - MAILBUS_CONFIG: path to a YAML configuration file (optional)
//! - MAILBUS__MESSAGING__TYPE / MAILBUS__MESSAGING__AMQP__URL: broker selection
//! - MAILBUS_TAP_GROUP: group name to consume as (default: "mailbus-tap")
//! - MAILBUS_LOG: log filter (default: info)
//! - MAILBUS_LOG_FORMAT: `json` for one JSON object per line (default: text)
//!
//! Events are decoded as JSON objects carrying at least `event_id` and
//! `username`; other fields are logged verbatim.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use mailbus::config::Config;
use mailbus::serializer::JsonEventSerializer;
use mailbus::utils::bootstrap::{init_tracing_with, shutdown_signal, LogFormat};
use mailbus::{broker, Event, EventBus, EventId, EventListener, Group, ListenerError, Username};

const DEFAULT_GROUP: &str = "mailbus-tap";

#[derive(Debug, Serialize, Deserialize)]
struct TapEvent {
    event_id: EventId,
    username: Username,
    #[serde(flatten)]
    payload: serde_json::Map<String, serde_json::Value>,
}

impl Event for TapEvent {
    fn event_id(&self) -> EventId {
        self.event_id
    }

    fn username(&self) -> &Username {
        &self.username
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct TapListener;

#[async_trait]
impl EventListener for TapListener {
    fn name(&self) -> &str {
        "mailbus-tap"
    }

    async fn handle(&self, event: Arc<dyn Event>) -> Result<(), ListenerError> {
        let payload = event
            .as_any()
            .downcast_ref::<TapEvent>()
            .map(|e| serde_json::Value::Object(e.payload.clone()))
            .unwrap_or(serde_json::Value::Null);

        info!(
            event_id = %event.event_id(),
            user = %event.username(),
            received_at = %chrono::Utc::now().to_rfc3339(),
            payload = %payload,
            "Event received"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing_with(LogFormat::from_env());

    let config = Config::load(None)?;
    let group_name = std::env::var("MAILBUS_TAP_GROUP").unwrap_or_else(|_| DEFAULT_GROUP.into());
    let group = Group::named(group_name)?;

    let broker = broker::from_config(&config.messaging)?;
    let bus = EventBus::builder(broker, Arc::new(JsonEventSerializer::<TapEvent>::new()))
        .configure(&config)?
        .build();

    bus.start().await?;
    let registration = bus.register_group(Arc::new(TapListener), group.clone()).await?;
    info!(group = %group, bus_name = %bus.naming().name(), "mailbus-tap started");

    shutdown_signal().await;

    registration.unregister().await?;
    bus.stop().await;
    Ok(())
}
