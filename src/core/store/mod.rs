//! Durable persistence SPI for queued messages.
//!
//! Backends (relational, embedded-file, document, broker-native) plug in
//! behind [`MessageStore`] and must preserve the queue semantics the engine
//! expects: a message is Pending until claimed, InFlight while a consumer
//! holds it, and ends up removed (acknowledged) or retained as dead.

pub mod memory;
pub mod provider;

use async_trait::async_trait;

use crate::core::error::BusResult;
use crate::core::message::{Message, QueueName, SenderIdentity};

pub use memory::MemoryMessageStore;
pub use provider::{global_providers, ProviderRegistry, StoreFactory};

/// A message as persisted and claimed: the producer message plus delivery
/// bookkeeping. Owned by exactly one queue for its lifetime.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,
    pub sender: Option<SenderIdentity>,
    /// Number of delivery attempts made so far, including the current one
    /// when returned from [`MessageStore::claim_next`].
    pub attempts: u32,
    pub enqueued_at_ms: u64,
}

/// Backend contract for durable queue storage.
///
/// `claim_next` is the only blocking suspension point: implementations wait
/// until a Pending message is eligible (its retry time has passed), mark it
/// InFlight, increment its attempt counter and return it.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Creates backend objects if needed. Called once before any queue is
    /// created.
    async fn init(&self) -> BusResult<()>;

    /// Allocates backend resources for a named queue.
    async fn create_queue(&self, queue: &QueueName) -> BusResult<()>;

    /// Durably stores the message as Pending. Returns once stored, not once
    /// delivered.
    async fn insert(&self, queue: &QueueName, message: QueuedMessage) -> BusResult<()>;

    /// Waits for, claims and returns the next eligible Pending message.
    async fn claim_next(&self, queue: &QueueName) -> BusResult<QueuedMessage>;

    /// Removes an InFlight message after successful delivery.
    async fn acknowledge(&self, queue: &QueueName, message_id: &str) -> BusResult<()>;

    /// Returns an InFlight message to Pending, eligible again at
    /// `retry_at_ms`.
    async fn abandon(&self, queue: &QueueName, message_id: &str, retry_at_ms: u64)
        -> BusResult<()>;

    /// Moves an InFlight message to the terminal Dead state, retained for
    /// inspection and excluded from delivery.
    async fn dead_letter(&self, queue: &QueueName, message_id: &str) -> BusResult<()>;

    /// Releases the queue's backend resources. What happens to InFlight
    /// messages is backend-specific and documented per backend.
    async fn remove_queue(&self, queue: &QueueName) -> BusResult<()>;

    /// Number of Pending (unclaimed) messages; used by tests and teardown
    /// diagnostics.
    async fn pending_count(&self, queue: &QueueName) -> BusResult<usize>;

    /// Snapshot of the queue's dead-lettered messages.
    async fn dead_letters(&self, queue: &QueueName) -> BusResult<Vec<QueuedMessage>>;
}

impl std::fmt::Debug for dyn MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn MessageStore")
    }
}
