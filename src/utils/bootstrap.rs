//! Bootstrap utilities for mailbus binaries.

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LOG_ENV_VAR, LOG_FORMAT_ENV_VAR};

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Initialize tracing with the MAILBUS_LOG environment variable.
///
/// Defaults to "info" level if MAILBUS_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Like [`init_tracing`], emitting one JSON object per line.
pub fn init_json_tracing() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Log output format of a binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// Read the format from MAILBUS_LOG_FORMAT. Anything but `json` is text.
    pub fn from_env() -> Self {
        Self::parse(std::env::var(LOG_FORMAT_ENV_VAR).ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(value) if value.trim().eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Initialize tracing in the requested format.
pub fn init_tracing_with(format: LogFormat) {
    match format {
        LogFormat::Text => init_tracing(),
        LogFormat::Json => init_json_tracing(),
    }
}

/// Resolve once the process receives Ctrl-C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}
