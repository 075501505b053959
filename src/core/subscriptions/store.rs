//! Persistence SPI for subscription tracking.
//!
//! Backends own their upsert semantics: insert, and on conflict for the same
//! (topic, subscriber) pair, update so the most recent TTL wins.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::core::error::BusResult;
use crate::core::message::TopicName;

/// A tracked subscription. `expires_at_ms == u64::MAX` means never expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: TopicName,
    pub subscriber_uri: String,
    pub expires_at_ms: u64,
}

impl Subscription {
    pub fn is_active(&self, now_ms: u64) -> bool {
        self.expires_at_ms > now_ms
    }
}

/// Durable backend contract for subscription records.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Creates backend objects if needed. Called once before any other
    /// operation.
    async fn init(&self) -> BusResult<()>;

    /// Inserts the record, or updates the expiration of an existing record
    /// for the same (topic, subscriber) pair.
    async fn upsert(&self, topic: &TopicName, subscriber_uri: &str, expires_at_ms: u64)
        -> BusResult<()>;

    /// Deletes the record for the (topic, subscriber) pair, if present.
    async fn delete(&self, topic: &TopicName, subscriber_uri: &str) -> BusResult<()>;

    /// Returns all records that are still active at `now_ms`.
    async fn select_active(&self, now_ms: u64) -> BusResult<Vec<Subscription>>;
}

/// Process-local reference backend.
#[derive(Debug, Default)]
pub struct MemorySubscriptionStore {
    records: DashMap<(TopicName, String), u64>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn init(&self) -> BusResult<()> {
        Ok(())
    }

    async fn upsert(
        &self,
        topic: &TopicName,
        subscriber_uri: &str,
        expires_at_ms: u64,
    ) -> BusResult<()> {
        self.records
            .insert((topic.clone(), subscriber_uri.to_owned()), expires_at_ms);
        Ok(())
    }

    async fn delete(&self, topic: &TopicName, subscriber_uri: &str) -> BusResult<()> {
        self.records
            .remove(&(topic.clone(), subscriber_uri.to_owned()));
        Ok(())
    }

    async fn select_active(&self, now_ms: u64) -> BusResult<Vec<Subscription>> {
        Ok(self
            .records
            .iter()
            .filter(|entry| *entry.value() > now_ms)
            .map(|entry| {
                let (topic, subscriber_uri) = entry.key().clone();
                Subscription {
                    topic,
                    subscriber_uri,
                    expires_at_ms: *entry.value(),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_replaces_expiration() {
        let store = MemorySubscriptionStore::new();
        let topic = TopicName::from("orders");
        store.upsert(&topic, "http://a/bus", 100).await.unwrap();
        store.upsert(&topic, "http://a/bus", 200).await.unwrap();

        let active = store.select_active(150).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].expires_at_ms, 200);
    }

    #[tokio::test]
    async fn select_active_filters_expired() {
        let store = MemorySubscriptionStore::new();
        let topic = TopicName::from("orders");
        store.upsert(&topic, "http://a/bus", 100).await.unwrap();
        store.upsert(&topic, "http://b/bus", u64::MAX).await.unwrap();

        let active = store.select_active(100).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].subscriber_uri, "http://b/bus");
    }
}
