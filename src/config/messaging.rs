//! Messaging backend configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process broker (no external dependency).
    #[default]
    Memory,
    /// AMQP/RabbitMQ broker.
    Amqp,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    pub amqp: AmqpConfig,
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Maximum number of pooled publishing channels.
    pub channel_pool_size: usize,
    /// How long to wait for a pooled channel before failing.
    pub borrow_timeout_ms: u64,
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn borrow_timeout(&self) -> Duration {
        Duration::from_millis(self.borrow_timeout_ms)
    }
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            channel_pool_size: 3,
            borrow_timeout_ms: 5000,
        }
    }
}
