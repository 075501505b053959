//! Process-wide mapping of queue name → queue engine instance.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::core::error::{BusError, BusResult};
use crate::core::message::{Message, QueueName, SenderIdentity};
use crate::core::queue::{MessageQueue, QueueListener, QueueOptions};
use crate::core::store::MessageStore;

/// Routes enqueue calls and guards against duplicate queue creation.
pub struct QueueRegistry {
    store: Arc<dyn MessageStore>,
    queues: DashMap<QueueName, Arc<MessageQueue>>,
    disposed: AtomicBool,
}

impl QueueRegistry {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            queues: DashMap::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Initializes the backend. Call once before creating queues.
    pub async fn init(&self) -> BusResult<()> {
        self.store.init().await
    }

    /// Creates a queue and starts its consumer pool.
    pub async fn create_queue(
        &self,
        name: impl Into<QueueName>,
        listener: Arc<dyn QueueListener>,
        options: QueueOptions,
    ) -> BusResult<()> {
        self.check_disposed()?;
        let name = name.into();
        if self.queues.contains_key(&name) {
            return Err(BusError::QueueAlreadyExists(name.to_string()));
        }

        self.store.create_queue(&name).await?;
        let queue = MessageQueue::new(
            name.clone(),
            listener,
            Arc::clone(&self.store),
            options,
        );
        match self.queues.entry(name.clone()) {
            Entry::Occupied(_) => return Err(BusError::QueueAlreadyExists(name.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&queue));
            }
        }
        queue.start();
        debug!(queue = %name, "queue created");
        Ok(())
    }

    /// Persists a message into the named queue; returns once durably stored.
    pub async fn enqueue(
        &self,
        name: &QueueName,
        message: Message,
        sender: Option<SenderIdentity>,
    ) -> BusResult<()> {
        self.check_disposed()?;
        let queue = self
            .queues
            .get(name)
            .map(|entry| Arc::clone(&*entry))
            .ok_or_else(|| BusError::QueueNotFound(name.to_string()))?;
        debug!(queue = %name, message_id = message.id(), "enqueueing message");
        queue.enqueue(message, sender).await
    }

    /// Stops the queue's consumer loops and releases its store resources.
    pub async fn delete_queue(&self, name: &QueueName) -> BusResult<()> {
        let (_, queue) = self
            .queues
            .remove(name)
            .ok_or_else(|| BusError::QueueNotFound(name.to_string()))?;
        queue.shutdown().await;
        self.store.remove_queue(name).await?;
        debug!(queue = %name, "queue deleted");
        Ok(())
    }

    /// Tears down every queue exactly once. Further operations fail with
    /// `ResourceDisposed`.
    pub async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let names: Vec<QueueName> = self.queues.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, queue)) = self.queues.remove(&name) {
                queue.shutdown().await;
            }
        }
    }

    fn check_disposed(&self) -> BusResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BusError::ResourceDisposed("queue registry"));
        }
        Ok(())
    }
}
