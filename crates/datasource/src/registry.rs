//! Process-wide registry of data-source instances.
//!
//! An explicit service with register/remove/lookup and a documented
//! lifecycle: a facade is registered when built (if a registry was given
//! to its builder) and removed when closed. Whatever performs external
//! naming binds against keys from here; the registry itself is plain
//! process-local state, not a global.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::DataSourceResult;

/// The facade surface the registry stores: enough for an external naming
/// layer to identify and tear down an instance.
#[async_trait]
pub trait PooledDataSource: Send + Sync + 'static {
    /// The configured source label, if any.
    fn data_source_name(&self) -> Option<String>;

    /// Close every pool the facade maintains and deregister it.
    async fn close(&self) -> DataSourceResult<()>;
}

/// Table of live data-source facades keyed by an opaque string.
#[derive(Default)]
pub struct InstanceRegistry {
    entries: Mutex<HashMap<String, Arc<dyn PooledDataSource>>>,
}

impl InstanceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a facade and return its assigned key.
    ///
    /// The key is `max(existing numeric keys) + 1`. The mapping is
    /// inserted under the same lock that computed the key, so a racing
    /// registrant can never observe (and take) the same key.
    pub fn register(&self, instance: Arc<dyn PooledDataSource>) -> String {
        let mut entries = self.entries.lock();
        let next = entries
            .keys()
            .filter_map(|k| k.parse::<u64>().ok())
            .max()
            .map_or(1, |max| max + 1);
        let key = next.to_string();
        entries.insert(key.clone(), instance);
        key
    }

    /// Remove a registration.
    pub fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Look up a registered facade.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<Arc<dyn PooledDataSource>> {
        self.entries.lock().get(key).map(Arc::clone)
    }

    /// Number of registered facades.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("len", &self.len())
            .finish()
    }
}
