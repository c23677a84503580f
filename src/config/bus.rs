//! Bus identity and retry configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::EXECUTION_RATE;
use crate::retry::{
    RetryBackoffConfiguration, RetryConfigError, DEFAULT_FIRST_BACKOFF, DEFAULT_JITTER_FACTOR,
    DEFAULT_MAX_RETRIES,
};

/// Default bus name, prefixing every broker resource.
pub const DEFAULT_BUS_NAME: &str = "mailboxEvent";
/// Default broker-side expiry of the per-instance key queue.
pub const DEFAULT_LOCAL_QUEUE_EXPIRY_SECS: u64 = 1800;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bus name. Buses with different names on one broker are isolated.
    pub name: String,
    /// Prefetch and concurrency ceiling of every consumer.
    pub execution_rate: u16,
    pub local_queue_expiry_secs: u64,
}

impl BusConfig {
    pub fn local_queue_expiry(&self) -> Duration {
        Duration::from_secs(self.local_queue_expiry_secs)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_BUS_NAME.to_string(),
            execution_rate: EXECUTION_RATE,
            local_queue_expiry_secs: DEFAULT_LOCAL_QUEUE_EXPIRY_SECS,
        }
    }
}

/// Raw retry settings, validated by [`RetryConfig::to_backoff_configuration`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub first_backoff_ms: u64,
    pub jitter_factor: f64,
}

impl RetryConfig {
    pub fn to_backoff_configuration(&self) -> Result<RetryBackoffConfiguration, RetryConfigError> {
        RetryBackoffConfiguration::builder()
            .max_retries(self.max_retries)
            .first_backoff(Duration::from_millis(self.first_backoff_ms))
            .jitter_factor(self.jitter_factor)
            .build()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            first_backoff_ms: DEFAULT_FIRST_BACKOFF.as_millis() as u64,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_jitter_is_reported() {
        let config = RetryConfig {
            jitter_factor: 2.0,
            ..Default::default()
        };
        assert_eq!(
            config.to_backoff_configuration(),
            Err(RetryConfigError::InvalidJitterFactor(2.0))
        );
    }

    #[test]
    fn test_local_queue_expiry_default() {
        assert_eq!(
            BusConfig::default().local_queue_expiry(),
            Duration::from_secs(30 * 60)
        );
    }
}
