//! Process-local reference backend.
//!
//! Messages live in per-queue state guarded by a mutex, with a
//! [`tokio::sync::Notify`] waking blocked claimants on insert and abandon.
//! Deleting a queue on this backend loses its InFlight messages; a shared
//! durable backend would instead make them eligible for redelivery
//! elsewhere.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

use crate::core::error::{BusError, BusResult};
use crate::core::message::{current_timestamp, QueueName};
use crate::core::store::{MessageStore, QueuedMessage};

/// Registry key under which this backend registers itself.
pub const PROVIDER_KEY: &str = "memory";

struct Stored {
    record: QueuedMessage,
    /// Earliest time the message may be claimed, ms since epoch.
    not_before_ms: u64,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Stored>,
    in_flight: HashMap<String, QueuedMessage>,
    dead: Vec<QueuedMessage>,
}

#[derive(Default)]
struct QueueSlot {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// In-memory [`MessageStore`] implementation.
#[derive(Default)]
pub struct MemoryMessageStore {
    queues: DashMap<QueueName, Arc<QueueSlot>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, queue: &QueueName) -> BusResult<Arc<QueueSlot>> {
        self.queues
            .get(queue)
            .map(|entry| Arc::clone(&*entry))
            .ok_or_else(|| BusError::QueueNotFound(queue.to_string()))
    }

    // Claims the first eligible pending message, or reports when the next
    // delayed one becomes eligible.
    fn try_claim(slot: &QueueSlot, now_ms: u64) -> (Option<QueuedMessage>, Option<u64>) {
        let mut state = slot.state.lock().expect("queue state lock");
        let eligible = state
            .pending
            .iter()
            .position(|stored| stored.not_before_ms <= now_ms);
        if let Some(idx) = eligible {
            let mut stored = state.pending.remove(idx).expect("index in bounds");
            stored.record.attempts += 1;
            let claimed = stored.record.clone();
            state
                .in_flight
                .insert(claimed.message.id().to_owned(), stored.record);
            return (Some(claimed), None);
        }
        let next_eligible = state.pending.iter().map(|s| s.not_before_ms).min();
        (None, next_eligible)
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn init(&self) -> BusResult<()> {
        Ok(())
    }

    async fn create_queue(&self, queue: &QueueName) -> BusResult<()> {
        self.queues
            .entry(queue.clone())
            .or_insert_with(|| Arc::new(QueueSlot::default()));
        Ok(())
    }

    async fn insert(&self, queue: &QueueName, message: QueuedMessage) -> BusResult<()> {
        let slot = self.slot(queue)?;
        {
            let mut state = slot.state.lock().expect("queue state lock");
            state.pending.push_back(Stored {
                record: message,
                not_before_ms: 0,
            });
        }
        slot.notify.notify_one();
        Ok(())
    }

    async fn claim_next(&self, queue: &QueueName) -> BusResult<QueuedMessage> {
        loop {
            // Re-fetch each pass so a deleted queue surfaces as an error
            // instead of a silent hang.
            let slot = self.slot(queue)?;
            let now_ms = current_timestamp();
            let (claimed, next_eligible_ms) = Self::try_claim(&slot, now_ms);
            if let Some(message) = claimed {
                return Ok(message);
            }
            match next_eligible_ms {
                Some(at_ms) => {
                    let delay = at_ms.saturating_sub(now_ms);
                    let deadline = Instant::now() + std::time::Duration::from_millis(delay);
                    tokio::select! {
                        _ = slot.notify.notified() => {}
                        _ = sleep_until(deadline) => {}
                    }
                }
                None => slot.notify.notified().await,
            }
        }
    }

    async fn acknowledge(&self, queue: &QueueName, message_id: &str) -> BusResult<()> {
        let slot = self.slot(queue)?;
        let mut state = slot.state.lock().expect("queue state lock");
        state.in_flight.remove(message_id);
        Ok(())
    }

    async fn abandon(
        &self,
        queue: &QueueName,
        message_id: &str,
        retry_at_ms: u64,
    ) -> BusResult<()> {
        let slot = self.slot(queue)?;
        {
            let mut state = slot.state.lock().expect("queue state lock");
            let record = state.in_flight.remove(message_id).ok_or_else(|| {
                BusError::Store(format!("message {message_id} is not in flight"))
            })?;
            state.pending.push_back(Stored {
                record,
                not_before_ms: retry_at_ms,
            });
        }
        slot.notify.notify_one();
        Ok(())
    }

    async fn dead_letter(&self, queue: &QueueName, message_id: &str) -> BusResult<()> {
        let slot = self.slot(queue)?;
        let mut state = slot.state.lock().expect("queue state lock");
        let record = state
            .in_flight
            .remove(message_id)
            .ok_or_else(|| BusError::Store(format!("message {message_id} is not in flight")))?;
        state.dead.push(record);
        Ok(())
    }

    async fn remove_queue(&self, queue: &QueueName) -> BusResult<()> {
        if let Some((_, slot)) = self.queues.remove(queue) {
            // Wake blocked claimants so they observe the missing queue.
            slot.notify.notify_waiters();
        }
        Ok(())
    }

    async fn pending_count(&self, queue: &QueueName) -> BusResult<usize> {
        let slot = self.slot(queue)?;
        let state = slot.state.lock().expect("queue state lock");
        Ok(state.pending.len())
    }

    async fn dead_letters(&self, queue: &QueueName) -> BusResult<Vec<QueuedMessage>> {
        let slot = self.slot(queue)?;
        let state = slot.state.lock().expect("queue state lock");
        Ok(state.dead.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Message;
    use std::time::Duration;

    fn record(body: &str) -> QueuedMessage {
        QueuedMessage {
            message: Message::new(body.to_owned()),
            sender: None,
            attempts: 0,
            enqueued_at_ms: current_timestamp(),
        }
    }

    #[tokio::test]
    async fn claim_increments_attempts() {
        let store = MemoryMessageStore::new();
        let queue = QueueName::from("q");
        store.create_queue(&queue).await.unwrap();
        store.insert(&queue, record("a")).await.unwrap();

        let claimed = store.claim_next(&queue).await.unwrap();
        assert_eq!(claimed.attempts, 1);
        assert_eq!(store.pending_count(&queue).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn acknowledge_removes_message() {
        let store = MemoryMessageStore::new();
        let queue = QueueName::from("q");
        store.create_queue(&queue).await.unwrap();
        store.insert(&queue, record("a")).await.unwrap();

        let claimed = store.claim_next(&queue).await.unwrap();
        store
            .acknowledge(&queue, claimed.message.id())
            .await
            .unwrap();
        assert_eq!(store.pending_count(&queue).await.unwrap(), 0);
        assert!(store.dead_letters(&queue).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn abandoned_message_is_reclaimable_after_delay() {
        let store = MemoryMessageStore::new();
        let queue = QueueName::from("q");
        store.create_queue(&queue).await.unwrap();
        store.insert(&queue, record("a")).await.unwrap();

        let first = store.claim_next(&queue).await.unwrap();
        store
            .abandon(&queue, first.message.id(), current_timestamp() + 20)
            .await
            .unwrap();

        let second = store.claim_next(&queue).await.unwrap();
        assert_eq!(second.message.id(), first.message.id());
        assert_eq!(second.attempts, 2);
    }

    #[tokio::test]
    async fn dead_letter_is_terminal() {
        let store = MemoryMessageStore::new();
        let queue = QueueName::from("q");
        store.create_queue(&queue).await.unwrap();
        store.insert(&queue, record("a")).await.unwrap();

        let claimed = store.claim_next(&queue).await.unwrap();
        store
            .dead_letter(&queue, claimed.message.id())
            .await
            .unwrap();

        assert_eq!(store.pending_count(&queue).await.unwrap(), 0);
        let dead = store.dead_letters(&queue).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.id(), claimed.message.id());
    }

    #[tokio::test]
    async fn claim_blocks_until_insert() {
        let store = Arc::new(MemoryMessageStore::new());
        let queue = QueueName::from("q");
        store.create_queue(&queue).await.unwrap();

        let claimer = {
            let store = Arc::clone(&store);
            let queue = queue.clone();
            tokio::spawn(async move { store.claim_next(&queue).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.insert(&queue, record("late")).await.unwrap();

        let claimed = claimer.await.unwrap().unwrap();
        assert_eq!(claimed.message.body, bytes::Bytes::from("late"));
    }

    #[tokio::test]
    async fn unknown_queue_errors() {
        let store = MemoryMessageStore::new();
        let err = store
            .insert(&QueueName::from("missing"), record("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::QueueNotFound(_)));
    }
}
