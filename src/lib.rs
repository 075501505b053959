//! Ferrobus – a message-bus runtime for independently deployed nodes.
//!
//! This crate exports
//!  * `core`    – queue engine, store SPI, subscription tracking and gossip
//!  * `config`  – TOML-driven runtime configuration
//!  * `logging` – tracing subscriber setup
//!
//! Point-to-point delivery is at-least-once: a message stays in its queue
//! until a listener acknowledges it, is retried after failures, and is
//! dead-lettered once its attempt budget is spent. Topic subscriptions are
//! tracked per node and kept eventually consistent across a cluster via UDP
//! multicast gossip. Idempotency is left to consumers.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod logging;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use crate::config::{load_config, Config};
pub use crate::core::error::{BusError, BusResult};
pub use crate::core::message::{Message, MessageHeaders, QueueName, SenderIdentity, TopicName};
pub use crate::core::queue::{DeliveryContext, QueueListener, QueueOptions, QueueRegistry};
pub use crate::core::store::{global_providers, MemoryMessageStore, MessageStore, QueuedMessage};
pub use crate::core::subscriptions::gossip::SubscriptionTracker;
pub use crate::core::subscriptions::{MemorySubscriptionStore, SubscriptionRegistry};
