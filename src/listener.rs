//! Listener contract consumed by the bus.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::event::Event;

/// Errors a listener reports back to the bus.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Listener failed: {0}")]
    Failed(String),

    #[error("Listener panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// How a listener wants to be executed relative to `dispatch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Executed inline by the dispatching process before `dispatch` returns.
    #[default]
    Synchronous,
    /// Executed only after a broker round trip.
    Asynchronous,
}

/// A consumer of bus events.
///
/// Implementations are supplied by the mailbox layer (search indexing, quota
/// updates, cache invalidation, ...). The bus holds an `Arc` for as long as the
/// corresponding [`Registration`](crate::registration::Registration) is live.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Name used in logs to identify the listener class.
    fn name(&self) -> &str;

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Synchronous
    }

    /// Whether this listener cares about `event` at all.
    fn is_handling(&self, _event: &dyn Event) -> bool {
        true
    }

    async fn handle(&self, event: Arc<dyn Event>) -> Result<(), ListenerError>;
}

/// Whether two listener handles point at the same listener instance.
pub(crate) fn same_listener(a: &Arc<dyn EventListener>, b: &Arc<dyn EventListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Run a listener, turning a panic into a [`ListenerError`].
pub(crate) async fn execute(
    listener: &Arc<dyn EventListener>,
    event: &Arc<dyn Event>,
) -> Result<(), ListenerError> {
    match AssertUnwindSafe(listener.handle(Arc::clone(event)))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ListenerError::Panicked(message))
        }
    }
}
