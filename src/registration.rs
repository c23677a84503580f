//! Subscription handles returned by `EventBus::register`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;

use crate::bus::Result;

type UnregisterAction = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handle to a live listener registration.
///
/// The only capability is [`unregister`](Registration::unregister). Calling it
/// more than once is harmless: only the first call reaches the bus.
pub struct Registration {
    unregistered: AtomicBool,
    action: UnregisterAction,
}

impl Registration {
    pub(crate) fn new<F>(action: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self {
            unregistered: AtomicBool::new(false),
            action: Box::new(action),
        }
    }

    /// Stop delivering events to the registered listener.
    pub async fn unregister(&self) -> Result<()> {
        if self.unregistered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        (self.action)().await
    }

    pub fn is_unregistered(&self) -> bool {
        self.unregistered.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("unregistered", &self.is_unregistered())
            .finish()
    }
}
