//! Retry policy for durable group deliveries, plus broker-operation backoffs.
//!
//! Group listener failures are retried by republishing through the group's
//! retry exchange. [`WaitDelayGenerator`] spaces those attempts with
//! jittered exponential delays and [`RetryDecision`] decides when to give up
//! and move the event to the dead-letter store.
//!
//! Transient broker faults (bind, publish, channel open) are retried in place
//! with `backon`, using the builders at the bottom of this module.

use std::time::Duration;

use backon::ExponentialBuilder;
use rand::Rng;
use serde::Deserialize;

/// Default maximum number of redeliveries for a failing group listener.
pub const DEFAULT_MAX_RETRIES: u32 = 8;
/// Default delay before the first redelivery.
pub const DEFAULT_FIRST_BACKOFF: Duration = Duration::from_millis(100);
/// Default jitter span, as a fraction of the first backoff.
pub const DEFAULT_JITTER_FACTOR: f64 = 0.5;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RetryConfigError {
    #[error("Jitter factor must be within [0, 1], got {0}")]
    InvalidJitterFactor(f64),

    #[error("First backoff must be non-zero")]
    ZeroFirstBackoff,
}

/// Immutable retry settings shared by every group of a bus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryBackoffConfiguration {
    max_retries: u32,
    first_backoff: Duration,
    jitter_factor: f64,
}

impl RetryBackoffConfiguration {
    pub fn builder() -> RetryBackoffConfigurationBuilder {
        RetryBackoffConfigurationBuilder::default()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn first_backoff(&self) -> Duration {
        self.first_backoff
    }

    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }
}

impl Default for RetryBackoffConfiguration {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            first_backoff: DEFAULT_FIRST_BACKOFF,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

/// Builder validating retry settings. Unset fields keep their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetryBackoffConfigurationBuilder {
    max_retries: Option<u32>,
    first_backoff_ms: Option<u64>,
    jitter_factor: Option<f64>,
}

impl RetryBackoffConfigurationBuilder {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn first_backoff(mut self, first_backoff: Duration) -> Self {
        self.first_backoff_ms = Some(u64::try_from(first_backoff.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = Some(jitter_factor);
        self
    }

    pub fn build(self) -> Result<RetryBackoffConfiguration, RetryConfigError> {
        let jitter_factor = self.jitter_factor.unwrap_or(DEFAULT_JITTER_FACTOR);
        if !(0.0..=1.0).contains(&jitter_factor) {
            return Err(RetryConfigError::InvalidJitterFactor(jitter_factor));
        }

        let first_backoff = self
            .first_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_FIRST_BACKOFF);
        if first_backoff.is_zero() {
            return Err(RetryConfigError::ZeroFirstBackoff);
        }

        Ok(RetryBackoffConfiguration {
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            first_backoff,
            jitter_factor,
        })
    }
}

/// Computes the delay owed before processing a redelivered event.
#[derive(Debug, Clone, Copy)]
pub struct WaitDelayGenerator {
    config: RetryBackoffConfiguration,
}

impl WaitDelayGenerator {
    pub fn new(config: RetryBackoffConfiguration) -> Self {
        Self { config }
    }

    /// Delay for the given retry count.
    ///
    /// Zero for counts outside `[1, max_retries]`. Otherwise
    /// `first_backoff * 2^(count - 1)` plus a uniform jitter in
    /// `[0, first_backoff * jitter_factor]`.
    pub fn delay(&self, retry_count: u32) -> Duration {
        if retry_count < 1 || retry_count > self.config.max_retries {
            return Duration::ZERO;
        }

        let factor = 2u32.saturating_pow(retry_count - 1);
        let base = self.config.first_backoff.saturating_mul(factor);
        let jitter_span = self
            .config
            .first_backoff
            .mul_f64(self.config.jitter_factor);
        let jitter = jitter_span.mul_f64(rand::rng().random_range(0.0..=1.0));

        base.saturating_add(jitter)
    }

    /// Suspend for the owed delay, if any.
    pub async fn delay_if_have_to(&self, retry_count: u32) {
        let delay = self.delay(retry_count);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Fate of a failed group delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Republish through the retry exchange with this retry count.
    Retry { retry_count: u32 },
    /// Give up and store the event as a dead letter.
    DeadLetter,
}

impl RetryDecision {
    pub fn after_failure(current_retry_count: u32, max_retries: u32) -> Self {
        let next = current_retry_count.saturating_add(1);
        if next > max_retries {
            Self::DeadLetter
        } else {
            Self::Retry { retry_count: next }
        }
    }
}

/// Backoff for transient broker operations (bind, unbind, publish).
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 5
/// - Jitter enabled
pub fn broker_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(5)
        .with_jitter()
}

/// Backoff for opening broker channels.
///
/// - Min delay: 100ms
/// - Max delay: 1 minute (never reached in 5 attempts)
/// - Max attempts: 5
pub fn channel_open_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(60))
        .with_max_times(5)
}

/// Backoff for establishing the broker connection at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_retries: u32, first_backoff_ms: u64, jitter: f64) -> RetryBackoffConfiguration {
        RetryBackoffConfiguration::builder()
            .max_retries(max_retries)
            .first_backoff(Duration::from_millis(first_backoff_ms))
            .jitter_factor(jitter)
            .build()
            .unwrap()
    }

    // ============================================================================
    // Configuration Tests
    // ============================================================================

    #[test]
    fn test_defaults() {
        let config = RetryBackoffConfiguration::default();
        assert_eq!(config.max_retries(), 8);
        assert_eq!(config.first_backoff(), Duration::from_millis(100));
        assert_eq!(config.jitter_factor(), 0.5);
        assert_eq!(RetryBackoffConfiguration::builder().build().unwrap(), config);
    }

    #[test]
    fn test_builder_rejects_out_of_range_jitter() {
        assert_eq!(
            RetryBackoffConfiguration::builder()
                .jitter_factor(1.5)
                .build(),
            Err(RetryConfigError::InvalidJitterFactor(1.5))
        );
        assert!(RetryBackoffConfiguration::builder()
            .jitter_factor(-0.1)
            .build()
            .is_err());
    }

    #[test]
    fn test_builder_rejects_zero_backoff() {
        assert_eq!(
            RetryBackoffConfiguration::builder()
                .first_backoff(Duration::ZERO)
                .build(),
            Err(RetryConfigError::ZeroFirstBackoff)
        );
    }

    // ============================================================================
    // Delay Tests
    // ============================================================================

    #[test]
    fn test_builder_saturates_oversized_backoff() {
        let config = RetryBackoffConfiguration::builder()
            .first_backoff(Duration::MAX)
            .build()
            .unwrap();
        assert_eq!(config.first_backoff(), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_delay_is_zero_outside_retry_window() {
        let generator = WaitDelayGenerator::new(config(3, 100, 0.5));
        assert_eq!(generator.delay(0), Duration::ZERO);
        assert_eq!(generator.delay(4), Duration::ZERO);
    }

    #[test]
    fn test_delay_without_jitter_is_exponential() {
        let generator = WaitDelayGenerator::new(config(4, 100, 0.0));
        assert_eq!(generator.delay(1), Duration::from_millis(100));
        assert_eq!(generator.delay(2), Duration::from_millis(200));
        assert_eq!(generator.delay(3), Duration::from_millis(400));
        assert_eq!(generator.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let generator = WaitDelayGenerator::new(config(8, 100, 0.5));
        for _ in 0..100 {
            let delay = generator.delay(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_large_retry_count_saturates() {
        let generator = WaitDelayGenerator::new(config(u32::MAX, 100, 0.0));
        assert!(generator.delay(u32::MAX) > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_delay_if_have_to_skips_zero_delay() {
        let generator = WaitDelayGenerator::new(config(3, 100, 0.0));
        let start = std::time::Instant::now();
        generator.delay_if_have_to(0).await;
        assert!(start.elapsed() < Duration::from_millis(50));

        generator.delay_if_have_to(2).await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    // ============================================================================
    // Retry Decision Tests
    // ============================================================================

    #[test]
    fn test_retry_until_count_would_exceed_max() {
        assert_eq!(
            RetryDecision::after_failure(0, 3),
            RetryDecision::Retry { retry_count: 1 }
        );
        assert_eq!(
            RetryDecision::after_failure(2, 3),
            RetryDecision::Retry { retry_count: 3 }
        );
        assert_eq!(RetryDecision::after_failure(3, 3), RetryDecision::DeadLetter);
    }

    #[test]
    fn test_zero_max_retries_dead_letters_immediately() {
        assert_eq!(RetryDecision::after_failure(0, 0), RetryDecision::DeadLetter);
    }
}
