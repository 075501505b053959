//! Explicit backend provider registry.
//!
//! Backends are registered under a string key at process start; there is no
//! runtime type scanning. The global registry ships with the in-memory
//! backend; embedders register additional backends before building queues.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::Arc;

use crate::core::error::{BusError, BusResult};
use crate::core::store::memory::{MemoryMessageStore, PROVIDER_KEY as MEMORY_PROVIDER};
use crate::core::store::MessageStore;

/// Constructor for a message store backend.
pub type StoreFactory = Arc<dyn Fn() -> Arc<dyn MessageStore> + Send + Sync>;

/// Maps provider key → store factory.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: DashMap<String, StoreFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the factory for `key`.
    pub fn register(&self, key: impl Into<String>, factory: StoreFactory) {
        self.factories.insert(key.into(), factory);
    }

    /// Builds a store for `key`, or fails when no such provider is
    /// registered.
    pub fn create(&self, key: &str) -> BusResult<Arc<dyn MessageStore>> {
        self.factories
            .get(key)
            .map(|factory| factory())
            .ok_or_else(|| BusError::Store(format!("no message store provider '{key}'")))
    }

    pub fn keys(&self) -> Vec<String> {
        self.factories
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

static GLOBAL: Lazy<ProviderRegistry> = Lazy::new(|| {
    let registry = ProviderRegistry::new();
    registry.register(
        MEMORY_PROVIDER,
        Arc::new(|| Arc::new(MemoryMessageStore::new()) as Arc<dyn MessageStore>),
    );
    registry
});

/// Process-wide provider registry, pre-populated with the built-in backends.
pub fn global_providers() -> &'static ProviderRegistry {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_provider_is_built_in() {
        let store = global_providers().create("memory");
        assert!(store.is_ok());
    }

    #[test]
    fn unknown_provider_fails() {
        let err = global_providers().create("oracle").unwrap_err();
        assert!(matches!(err, BusError::Store(_)));
    }
}
