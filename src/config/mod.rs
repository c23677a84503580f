//! Application configuration.
//!
//! Aggregates bus, retry and messaging settings into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod bus;
mod messaging;

pub use bus::{BusConfig, RetryConfig, DEFAULT_BUS_NAME, DEFAULT_LOCAL_QUEUE_EXPIRY_SECS};
pub use messaging::{AmqpConfig, MessagingConfig, MessagingType};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "mailbus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MAILBUS_CONFIG";
/// Prefix for environment variable overrides (`MAILBUS__BUS__NAME=...`).
pub const CONFIG_ENV_PREFIX: &str = "MAILBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MAILBUS_LOG";
/// Environment variable selecting the log output format (`text` or `json`).
pub const LOG_FORMAT_ENV_VAR: &str = "MAILBUS_LOG_FORMAT";

/// Bus configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bus: BusConfig,
    pub retry: RetryConfig,
    pub messaging: MessagingConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, later ones overriding earlier ones:
    /// - `mailbus.yaml` in the current directory (optional)
    /// - `path`, when given
    /// - the file named by `MAILBUS_CONFIG`, when set
    /// - `MAILBUS__*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.bus.name, "mailboxEvent");
        assert_eq!(config.bus.execution_rate, 10);
        assert_eq!(config.retry.max_retries, 8);
        assert_eq!(config.messaging.messaging_type, MessagingType::Memory);
    }

    #[test]
    #[serial]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "bus:\n  name: other\nretry:\n  max_retries: 3\n  first_backoff_ms: 20\nmessaging:\n  type: amqp\n  amqp:\n    url: amqp://rabbit:5672\n"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();

        assert_eq!(config.bus.name, "other");
        assert_eq!(config.bus.execution_rate, 10);
        assert_eq!(config.messaging.messaging_type, MessagingType::Amqp);
        assert_eq!(config.messaging.amqp.url, "amqp://rabbit:5672");
        assert_eq!(config.messaging.amqp.channel_pool_size, 3);

        let retry = config.retry.to_backoff_configuration().unwrap();
        assert_eq!(retry.max_retries(), 3);
        assert_eq!(retry.first_backoff(), Duration::from_millis(20));
    }

    #[test]
    #[serial]
    fn test_environment_overrides() {
        std::env::set_var("MAILBUS__BUS__NAME", "fromEnv");
        std::env::set_var("MAILBUS__RETRY__MAX_RETRIES", "2");
        let config = Config::load(None);
        std::env::remove_var("MAILBUS__BUS__NAME");
        std::env::remove_var("MAILBUS__RETRY__MAX_RETRIES");

        let config = config.unwrap();
        assert_eq!(config.bus.name, "fromEnv");
        assert_eq!(config.retry.max_retries, 2);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        assert!(Config::load(Some("/nonexistent/mailbus.yaml")).is_err());
    }
}
