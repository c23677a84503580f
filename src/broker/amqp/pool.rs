//! Bounded pool of AMQP channels.
//!
//! Channels are opened lazily over the shared cached connection and handed
//! out one per operation. A channel whose operation failed, or which is no
//! longer open, is closed instead of being returned to the pool.

use std::future::Future;
use std::time::Duration;

use backon::Retryable;
use deadpool::managed::{self, Metrics, Object, PoolError, RecycleError, RecycleResult, TimeoutType};
use deadpool::Runtime;
use lapin::options::ConfirmSelectOptions;
use lapin::Channel;
use tracing::{debug, warn};

use crate::broker::{BrokerError, Result};
use crate::retry::channel_open_backoff;

/// Opens channels over the cached connection.
pub struct ChannelManager {
    connections: deadpool_lapin::Pool,
}

impl ChannelManager {
    pub fn new(connections: deadpool_lapin::Pool) -> Self {
        Self { connections }
    }

    async fn open_channel(&self) -> Result<Channel> {
        let connection = self
            .connections
            .get()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to get connection: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to create channel: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to enable confirms: {}", e)))?;

        Ok(channel)
    }
}

impl managed::Manager for ChannelManager {
    type Type = Channel;
    type Error = BrokerError;

    async fn create(&self) -> std::result::Result<Channel, BrokerError> {
        (|| self.open_channel())
            .retry(channel_open_backoff())
            .notify(|err: &BrokerError, dur: Duration| {
                warn!(error = %err, delay = ?dur, "Failed to open channel, retrying");
            })
            .await
    }

    async fn recycle(&self, channel: &mut Channel, _: &Metrics) -> RecycleResult<BrokerError> {
        if channel.status().connected() {
            Ok(())
        } else {
            Err(RecycleError::Message("channel is closed".into()))
        }
    }
}

/// Pooled channel handle.
pub type PooledChannel = Object<ChannelManager>;

/// Fixed-capacity channel pool with a bounded borrow wait.
pub struct ChannelPool {
    pool: managed::Pool<ChannelManager>,
    borrow_timeout: Duration,
}

impl ChannelPool {
    pub fn new(
        connections: deadpool_lapin::Pool,
        size: usize,
        borrow_timeout: Duration,
    ) -> Result<Self> {
        let pool = managed::Pool::builder(ChannelManager::new(connections))
            .max_size(size)
            .wait_timeout(Some(borrow_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| BrokerError::Channel(format!("Failed to build channel pool: {}", e)))?;

        Ok(Self {
            pool,
            borrow_timeout,
        })
    }

    /// Borrow a channel, waiting at most the configured borrow timeout.
    pub async fn borrow(&self) -> Result<PooledChannel> {
        self.pool.get().await.map_err(|e| match e {
            PoolError::Timeout(TimeoutType::Wait) => BrokerError::PoolTimeout(self.borrow_timeout),
            PoolError::Backend(e) => e,
            other => BrokerError::Channel(other.to_string()),
        })
    }

    /// Return a channel. Channels from failed operations, or which are no
    /// longer open, are closed and dropped from the pool.
    pub async fn release(&self, channel: PooledChannel, clean: bool) {
        if clean && channel.status().connected() {
            return;
        }

        let channel = Object::take(channel);
        debug!(clean, "Discarding pooled channel");
        if channel.status().connected() {
            if let Err(e) = channel.close(200, "discarded").await {
                debug!(error = %e, "Failed to close discarded channel");
            }
        }
    }

    /// Run `op` on a borrowed channel, then release it according to the
    /// outcome.
    pub async fn with_channel<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let channel = self.borrow().await?;
        let result = op((*channel).clone()).await;
        self.release(channel, result.is_ok()).await;
        result
    }
}
