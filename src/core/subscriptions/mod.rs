//! Subscription tracking: topic → active subscribers with TTL expiry.
//!
//! The in-memory view holds one immutable snapshot per topic, swapped
//! atomically on mutation so readers never observe a partially updated
//! subscriber set. Expired entries are filtered lazily at read time; they are
//! reaped from the backend only when it chooses to.

pub mod datagram;
pub mod gossip;
pub mod store;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::core::error::{BusError, BusResult};
use crate::core::message::{current_timestamp, TopicName};

pub use store::{MemorySubscriptionStore, Subscription, SubscriptionStore};

/// Expiration for a subscription created now with the given TTL.
/// A zero TTL means the subscription never expires.
fn expiration(ttl: Duration) -> u64 {
    if ttl.is_zero() {
        u64::MAX
    } else {
        current_timestamp().saturating_add(ttl.as_millis() as u64)
    }
}

/// Backend-persisted map of topic → active subscribers.
pub struct SubscriptionRegistry {
    store: Arc<dyn SubscriptionStore>,
    topics: DashMap<TopicName, Arc<[Subscription]>>,
    disposed: AtomicBool,
}

impl SubscriptionRegistry {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self {
            store,
            topics: DashMap::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Seeds the in-memory map from the backend. Must run before any other
    /// operation; this is how a restarted node catches up on subscription
    /// history that predates it.
    pub async fn init(&self) -> BusResult<()> {
        self.store.init().await?;
        let active = self.store.select_active(current_timestamp()).await?;
        for subscription in active {
            let topic = subscription.topic.clone();
            self.merge(topic, subscription);
        }
        Ok(())
    }

    /// Adds or refreshes a subscription. The backend upsert runs first so a
    /// crash between the two steps loses nothing; the snapshot swap then
    /// makes the entry visible, replacing any prior entry for the same
    /// subscriber.
    pub async fn add_subscription(
        &self,
        topic: &TopicName,
        subscriber_uri: &str,
        ttl: Duration,
    ) -> BusResult<()> {
        self.check_disposed()?;
        let expires_at_ms = expiration(ttl);
        self.store.upsert(topic, subscriber_uri, expires_at_ms).await?;

        let subscription = Subscription {
            topic: topic.clone(),
            subscriber_uri: subscriber_uri.to_owned(),
            expires_at_ms,
        };
        self.merge(topic.clone(), subscription);
        debug!(topic = %topic, subscriber = subscriber_uri, "subscription added");
        Ok(())
    }

    /// Removes a subscription from the active view and deletes the persisted
    /// record.
    pub async fn remove_subscription(
        &self,
        topic: &TopicName,
        subscriber_uri: &str,
    ) -> BusResult<()> {
        self.check_disposed()?;
        self.store.delete(topic, subscriber_uri).await?;

        if let Entry::Occupied(mut entry) = self.topics.entry(topic.clone()) {
            let remaining: Vec<Subscription> = entry
                .get()
                .iter()
                .filter(|s| s.subscriber_uri != subscriber_uri)
                .cloned()
                .collect();
            entry.insert(Arc::from(remaining));
        }
        debug!(topic = %topic, subscriber = subscriber_uri, "subscription removed");
        Ok(())
    }

    /// Returns the URIs of subscribers whose expiration is strictly after
    /// now. Never mutates state.
    pub fn subscribers(&self, topic: &TopicName) -> Vec<String> {
        let now_ms = current_timestamp();
        self.topics
            .get(topic)
            .map(|snapshot| {
                snapshot
                    .iter()
                    .filter(|s| s.is_active(now_ms))
                    .map(|s| s.subscriber_uri.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Marks the registry disposed; subsequent mutations fail.
    pub fn shutdown(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    // Publishes a new snapshot for the topic with `subscription` merged in,
    // replacing a prior entry for the same subscriber. The DashMap entry
    // guard makes the read-modify-write atomic per key.
    fn merge(&self, topic: TopicName, subscription: Subscription) {
        match self.topics.entry(topic) {
            Entry::Occupied(mut entry) => {
                let uri = subscription.subscriber_uri.clone();
                let mut merged: Vec<Subscription> = Vec::with_capacity(entry.get().len() + 1);
                merged.push(subscription);
                merged.extend(
                    entry
                        .get()
                        .iter()
                        .filter(|s| s.subscriber_uri != uri)
                        .cloned(),
                );
                entry.insert(Arc::from(merged));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::from(vec![subscription]));
            }
        }
    }

    fn check_disposed(&self) -> BusResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BusError::ResourceDisposed("subscription registry"));
        }
        Ok(())
    }
}
