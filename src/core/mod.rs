//! Delivery-guarantee core: queue engine, store SPI and subscription
//! tracking.

pub mod error;
pub mod message;
pub mod queue;
pub mod store;
pub mod subscriptions;
