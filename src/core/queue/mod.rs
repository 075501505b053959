//! Queue engine: the enqueue → deliver → acknowledge/retry/dead-letter state
//! machine.
//!
//! Each queue runs a fixed pool of consumer loops over its store. A single
//! message-processing failure never terminates a loop; failures are logged
//! and the message is retried after the configured delay until the attempt
//! budget is spent, at which point it is dead-lettered.

pub mod registry;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::core::error::{BusError, BusResult};
use crate::core::message::{current_timestamp, Message, QueueName, SenderIdentity};
use crate::core::store::{MessageStore, QueuedMessage};

pub use registry::QueueRegistry;

/// Per-queue delivery options. Immutable after queue creation.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// When enabled, a message counts as delivered as soon as it is claimed,
    /// regardless of listener outcome.
    pub auto_acknowledge: bool,
    /// Number of parallel consumer loops; the only in-process parallelism
    /// control for a queue.
    pub concurrency_limit: usize,
    /// Delivery attempts before a message is dead-lettered.
    pub max_attempts: u32,
    /// Delay before an abandoned message becomes eligible again.
    pub retry_delay: Duration,
    /// Hint to the backend; the in-memory backend ignores it.
    pub durable: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            auto_acknowledge: false,
            concurrency_limit: 1,
            max_attempts: 10,
            retry_delay: Duration::from_millis(500),
            durable: true,
        }
    }
}

/// Mutable acknowledgment handle passed to the listener along with the
/// message.
#[derive(Debug)]
pub struct DeliveryContext {
    sender: Option<SenderIdentity>,
    attempt: u32,
    acknowledged: bool,
}

impl DeliveryContext {
    fn new(sender: Option<SenderIdentity>, attempt: u32) -> Self {
        Self {
            sender,
            attempt,
            acknowledged: false,
        }
    }

    /// Identity of the principal that enqueued the message, if recorded.
    pub fn sender(&self) -> Option<&SenderIdentity> {
        self.sender.as_ref()
    }

    /// 1-based number of the current delivery attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Marks the delivery successful; the engine commits it after the
    /// listener returns.
    pub fn acknowledge(&mut self) {
        self.acknowledged = true;
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }
}

/// Handler invoked by consumer loops for each claimed message.
///
/// A returned error is a per-message outcome consumed by the retry logic; it
/// is never surfaced to the enqueuing caller.
#[async_trait]
pub trait QueueListener: Send + Sync {
    async fn message_received(
        &self,
        message: &Message,
        context: &mut DeliveryContext,
    ) -> anyhow::Result<()>;
}

/// A single named queue: options, listener and its pool of consumer loops.
pub struct MessageQueue {
    name: QueueName,
    listener: Arc<dyn QueueListener>,
    store: Arc<dyn MessageStore>,
    options: QueueOptions,
    shutdown: broadcast::Sender<()>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl MessageQueue {
    pub(crate) fn new(
        name: QueueName,
        listener: Arc<dyn QueueListener>,
        store: Arc<dyn MessageStore>,
        mut options: QueueOptions,
    ) -> Arc<Self> {
        options.concurrency_limit = options.concurrency_limit.max(1);
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            name,
            listener,
            store,
            options,
            shutdown,
            consumers: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    /// Spawns the consumer pool.
    pub(crate) fn start(self: &Arc<Self>) {
        let mut consumers = self.consumers.lock().expect("consumers lock");
        for _ in 0..self.options.concurrency_limit {
            let queue = Arc::clone(self);
            let shutdown = self.shutdown.subscribe();
            consumers.push(tokio::spawn(queue.consume(shutdown)));
        }
    }

    /// Persists the message as Pending. Returns once durably stored, not
    /// once delivered.
    pub async fn enqueue(
        &self,
        message: Message,
        sender: Option<SenderIdentity>,
    ) -> BusResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BusError::ResourceDisposed("queue"));
        }
        let record = QueuedMessage {
            message,
            sender,
            attempts: 0,
            enqueued_at_ms: current_timestamp(),
        };
        self.store.insert(&self.name, record).await
    }

    /// Signals cancellation and waits for the consumer loops to observe it.
    /// An in-flight listener invocation may finish later; its message stays
    /// unacknowledged and is redelivered where the backend allows.
    pub async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());
        let handles: Vec<JoinHandle<()>> =
            self.consumers.lock().expect("consumers lock").drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        debug!(queue = %self.name, "consumer loops stopped");
    }

    async fn consume(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let claimed = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                claimed = self.store.claim_next(&self.name) => claimed,
            };
            match claimed {
                Ok(message) => self.deliver(message).await,
                Err(e) => {
                    // Backend trouble shares the log-and-continue path with
                    // listener failures, with a pause so a dead backend does
                    // not hot-loop.
                    warn!(queue = %self.name, error = %e, "claim failed; backing off");
                    let backoff = self.options.retry_delay.max(Duration::from_millis(100));
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    async fn deliver(&self, claimed: QueuedMessage) {
        let message_id = claimed.message.id().to_owned();

        if claimed.message.is_expired(current_timestamp()) {
            debug!(queue = %self.name, message_id = %message_id, "discarding expired message");
            if let Err(e) = self.store.acknowledge(&self.name, &message_id).await {
                error!(queue = %self.name, message_id = %message_id, error = %e, "failed to discard expired message");
            }
            return;
        }

        if self.options.auto_acknowledge {
            if let Err(e) = self.store.acknowledge(&self.name, &message_id).await {
                error!(queue = %self.name, message_id = %message_id, error = %e, "auto-acknowledge failed");
                return;
            }
            let mut context = DeliveryContext::new(claimed.sender.clone(), claimed.attempts);
            if let Err(e) = self
                .listener
                .message_received(&claimed.message, &mut context)
                .await
            {
                // Already acknowledged; the failure is final by contract.
                warn!(queue = %self.name, message_id = %message_id, error = %e, "listener failed after auto-acknowledge");
            }
            return;
        }

        let mut context = DeliveryContext::new(claimed.sender.clone(), claimed.attempts);
        match self
            .listener
            .message_received(&claimed.message, &mut context)
            .await
        {
            Ok(()) if context.is_acknowledged() => {
                if let Err(e) = self.store.acknowledge(&self.name, &message_id).await {
                    error!(queue = %self.name, message_id = %message_id, error = %e, "acknowledge failed");
                }
            }
            Ok(()) => {
                debug!(queue = %self.name, message_id = %message_id, "listener did not acknowledge; scheduling redelivery");
                self.retry_or_dead_letter(&message_id, claimed.attempts).await;
            }
            Err(e) => {
                warn!(
                    queue = %self.name,
                    message_id = %message_id,
                    attempt = claimed.attempts,
                    error = %e,
                    "listener failed"
                );
                self.retry_or_dead_letter(&message_id, claimed.attempts).await;
            }
        }
    }

    async fn retry_or_dead_letter(&self, message_id: &str, attempts: u32) {
        if attempts >= self.options.max_attempts {
            match self.store.dead_letter(&self.name, message_id).await {
                Ok(()) => warn!(
                    queue = %self.name,
                    message_id = %message_id,
                    attempts,
                    "attempt budget spent; message dead-lettered"
                ),
                Err(e) => error!(queue = %self.name, message_id = %message_id, error = %e, "dead-letter failed"),
            }
            return;
        }
        let retry_at_ms =
            current_timestamp().saturating_add(self.options.retry_delay.as_millis() as u64);
        if let Err(e) = self.store.abandon(&self.name, message_id, retry_at_ms).await {
            error!(queue = %self.name, message_id = %message_id, error = %e, "abandon failed");
        }
    }
}
