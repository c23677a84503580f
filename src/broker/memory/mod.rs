//! In-process broker for standalone mode.
//!
//! Implements the AMQP semantics the bus depends on, within one process:
//! - direct exchanges routing on exact routing-key match
//! - competing consumers served round-robin, bounded by prefetch
//! - manual ack; reject dead-letters to the queue's dead-letter exchange
//! - deliveries dropped without settlement are requeued at the head
//! - auto-delete queues vanish when their last consumer is cancelled
//!
//! Queue expiry is accepted but not enforced.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use super::{
    Acker, Binding, Broker, BrokerError, ConsumeOptions, Consumer, ConsumerCancel, Delivery,
    ExchangeSpec, Headers, OutboundMessage, QueueSpec, Result,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    headers: Headers,
    body: Arc<[u8]>,
}

struct ConsumerSlot {
    tag: String,
    sender: mpsc::UnboundedSender<Delivery>,
    prefetch: u16,
    in_flight: usize,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct QueueState {
    spec: QueueSpec,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

#[derive(Default)]
struct State {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    /// (exchange, routing key) -> bound queues
    bindings: HashMap<(String, String), BTreeSet<String>>,
}

enum Settlement {
    Ack,
    Reject,
    Requeue,
}

impl State {
    fn route(&mut self, exchange: &str, message: &StoredMessage, inner: &Weak<Inner>) -> Result<usize> {
        if !self.exchanges.contains(exchange) {
            return Err(BrokerError::NotFound(format!("exchange '{}'", exchange)));
        }

        let targets: Vec<String> = self
            .bindings
            .get(&(exchange.to_string(), message.routing_key.clone()))
            .map(|queues| queues.iter().cloned().collect())
            .unwrap_or_default();

        for queue in &targets {
            if let Some(state) = self.queues.get_mut(queue) {
                state.messages.push_back(message.clone());
            }
            self.pump(queue, inner);
        }

        Ok(targets.len())
    }

    /// Hand ready messages to consumers with spare prefetch capacity.
    fn pump(&mut self, queue: &str, inner: &Weak<Inner>) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };

        while !state.messages.is_empty() && !state.consumers.is_empty() {
            let count = state.consumers.len();
            let Some(index) = (0..count)
                .map(|offset| (state.cursor + offset) % count)
                .find(|&i| state.consumers[i].has_capacity())
            else {
                break;
            };
            let Some(message) = state.messages.pop_front() else {
                break;
            };
            state.cursor = (index + 1) % count;

            let settled = Arc::new(AtomicBool::new(false));
            let slot = &mut state.consumers[index];
            let acker = MemoryAcker {
                inner: inner.clone(),
                queue: queue.to_string(),
                tag: slot.tag.clone(),
                message: message.clone(),
                settled: Arc::clone(&settled),
            };
            let delivery = Delivery::new(
                message.routing_key.clone(),
                message.headers.clone(),
                Arc::clone(&message.body),
                Box::new(acker),
            );

            match slot.sender.send(delivery) {
                Ok(()) => slot.in_flight += 1,
                Err(mpsc::error::SendError(returned)) => {
                    // Receiver is gone: forget the consumer and keep the message.
                    settled.store(true, Ordering::SeqCst);
                    drop(returned);
                    debug!(queue = %queue, "Dropping consumer with closed receiver");
                    state.consumers.remove(index);
                    state.messages.push_front(message);
                    state.cursor = 0;
                }
            }
        }
    }

    fn settle(
        &mut self,
        queue: &str,
        tag: &str,
        message: StoredMessage,
        settlement: Settlement,
        inner: &Weak<Inner>,
    ) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        if let Some(slot) = state.consumers.iter_mut().find(|c| c.tag == tag) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }

        match settlement {
            Settlement::Ack => {}
            Settlement::Requeue => state.messages.push_front(message),
            Settlement::Reject => {
                if let Some(dlx) = state.spec.dead_letter_exchange.clone() {
                    if let Err(e) = self.route(&dlx, &message, inner) {
                        warn!(queue = %queue, error = %e, "Failed to dead-letter rejected message");
                    }
                }
            }
        }

        self.pump(queue, inner);
    }

    fn remove_queue(&mut self, queue: &str) -> bool {
        for queues in self.bindings.values_mut() {
            queues.remove(queue);
        }
        self.bindings.retain(|_, queues| !queues.is_empty());
        self.queues.remove(queue).is_some()
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    fail_on_publish: AtomicBool,
    published: AtomicUsize,
    next_tag: AtomicUsize,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct MemoryAcker {
    inner: Weak<Inner>,
    queue: String,
    tag: String,
    message: StoredMessage,
    settled: Arc<AtomicBool>,
}

impl MemoryAcker {
    fn settle(&self, settlement: Settlement) {
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        inner.lock().settle(
            &self.queue,
            &self.tag,
            self.message.clone(),
            settlement,
            &self.inner,
        );
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.settle(Settlement::Ack);
        Ok(())
    }

    async fn reject(self: Box<Self>) -> Result<()> {
        self.settle(Settlement::Reject);
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        self.settle(Settlement::Requeue);
    }
}

struct MemoryConsumerCancel {
    inner: Weak<Inner>,
    queue: String,
    tag: String,
}

#[async_trait]
impl ConsumerCancel for MemoryConsumerCancel {
    async fn cancel(&self) -> Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        let mut state = inner.lock();
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Ok(());
        };
        queue.consumers.retain(|c| c.tag != self.tag);
        if queue.spec.auto_delete && queue.consumers.is_empty() {
            debug!(queue = %self.queue, "Auto-deleting queue after last consumer");
            state.remove_queue(&self.queue);
        }
        Ok(())
    }
}

/// In-process [`Broker`].
///
/// Clones share the same exchanges and queues, so several buses built on
/// clones of one broker behave like processes connected to one RabbitMQ.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail (for testing failure paths).
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.inner.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Number of successful publishes so far.
    pub fn published_count(&self) -> usize {
        self.inner.published.load(Ordering::SeqCst)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.lock().queues.contains_key(queue)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages waiting in `queue` (not yet delivered to a consumer).
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Bindings currently routing into `queue`, sorted.
    pub fn bindings_of(&self, queue: &str) -> Vec<Binding> {
        let state = self.inner.lock();
        let mut bindings: Vec<Binding> = state
            .bindings
            .iter()
            .filter(|(_, queues)| queues.contains(queue))
            .map(|((exchange, routing_key), _)| Binding::new(queue, exchange, routing_key))
            .collect();
        bindings.sort_by(|a, b| {
            (&a.exchange, &a.routing_key).cmp(&(&b.exchange, &b.routing_key))
        });
        bindings
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        self.inner.lock().exchanges.insert(spec.name.clone());
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let mut state = self.inner.lock();
        match state.queues.get(&spec.name) {
            Some(existing)
                if existing.spec.durable != spec.durable
                    || existing.spec.exclusive != spec.exclusive
                    || existing.spec.dead_letter_exchange != spec.dead_letter_exchange =>
            {
                Err(BrokerError::Declare(format!(
                    "queue '{}' already declared with different arguments",
                    spec.name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    QueueState {
                        spec: spec.clone(),
                        messages: VecDeque::new(),
                        consumers: Vec::new(),
                        cursor: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.inner.lock().remove_queue(name);
        Ok(())
    }

    async fn bind(&self, binding: &Binding) -> Result<()> {
        let mut state = self.inner.lock();
        if !state.queues.contains_key(&binding.queue) {
            return Err(BrokerError::NotFound(format!("queue '{}'", binding.queue)));
        }
        if !state.exchanges.contains(&binding.exchange) {
            return Err(BrokerError::NotFound(format!(
                "exchange '{}'",
                binding.exchange
            )));
        }
        state
            .bindings
            .entry((binding.exchange.clone(), binding.routing_key.clone()))
            .or_default()
            .insert(binding.queue.clone());
        Ok(())
    }

    async fn unbind(&self, binding: &Binding) -> Result<()> {
        let mut state = self.inner.lock();
        let key = (binding.exchange.clone(), binding.routing_key.clone());
        if let Some(queues) = state.bindings.get_mut(&key) {
            queues.remove(&binding.queue);
            if queues.is_empty() {
                state.bindings.remove(&key);
            }
        }
        Ok(())
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        if self.inner.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish(
                "publishing disabled on memory broker".to_string(),
            ));
        }

        let stored = StoredMessage {
            routing_key: message.routing_key.clone(),
            headers: message.headers.clone(),
            body: Arc::clone(&message.body),
        };
        let weak = Arc::downgrade(&self.inner);
        let routed = self.inner.lock().route(&message.exchange, &stored, &weak)?;
        self.inner.published.fetch_add(1, Ordering::SeqCst);

        debug!(
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            queues = routed,
            "Published message"
        );
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let tag = if options.consumer_tag.is_empty() {
            format!(
                "memory-consumer-{}",
                self.inner.next_tag.fetch_add(1, Ordering::SeqCst)
            )
        } else {
            options.consumer_tag
        };

        let weak = Arc::downgrade(&self.inner);
        {
            let mut state = self.inner.lock();
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::NotFound(format!("queue '{}'", queue)))?;
            queue_state.consumers.push(ConsumerSlot {
                tag: tag.clone(),
                sender,
                prefetch: options.prefetch,
                in_flight: 0,
            });
            state.pump(queue, &weak);
        }

        debug!(queue = %queue, consumer_tag = %tag, "Started memory consumer");

        Ok(Consumer {
            deliveries: UnboundedReceiverStream::new(receiver).boxed(),
            cancel: Arc::new(MemoryConsumerCancel {
                inner: weak,
                queue: queue.to_string(),
                tag,
            }),
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
