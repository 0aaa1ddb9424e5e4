//! Keyed object pool: one sub-pool per key over a shared factory.
//!
//! Every key gets its own [`ObjectPool`] bound to that key through an
//! adapter, so the borrow/return/eviction machinery exists exactly once.
//! Sub-pools are created on first borrow for a key; creation is atomic
//! per key (two racing first borrows share one sub-pool).

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::object::{PoolStats, Poolable};
use crate::pool::{ObjectPool, PooledFactory};

/// Lifecycle callbacks for keyed pools. Mirrors [`PooledFactory`] with
/// the key threaded through every call.
#[async_trait]
pub trait KeyedPooledFactory: Send + Sync + 'static {
    /// Sub-pool identity.
    type Key: Clone + Eq + Hash + Send + Sync + 'static;
    /// The pooled object type.
    type Object: Poolable;

    /// Create a new object for `key`.
    async fn make_object(&self, key: &Self::Key) -> PoolResult<Self::Object>;

    /// Prepare an object for hand-out.
    async fn activate_object(&self, _key: &Self::Key, _obj: &Self::Object) -> PoolResult<()> {
        Ok(())
    }

    /// Prepare an object for idling.
    async fn passivate_object(&self, _key: &Self::Key, _obj: &Self::Object) -> PoolResult<()> {
        Ok(())
    }

    /// Check whether an object is still usable.
    async fn validate_object(&self, _key: &Self::Key, _obj: &Self::Object) -> bool {
        true
    }

    /// Tear an object down when it is permanently removed.
    async fn destroy_object(&self, key: &Self::Key, obj: Self::Object) -> PoolResult<()>;
}

/// Adapter binding one key to a keyed factory, so a plain [`ObjectPool`]
/// can serve as the per-key sub-pool.
///
/// The bound key is refreshed on every borrow: map equality may be
/// coarser than the full key value (that is the point for
/// credential-style keys), and creations must authenticate with what the
/// *current* borrower supplied, not whatever key first created the
/// sub-pool.
struct KeyBound<F: KeyedPooledFactory> {
    factory: Arc<F>,
    key: parking_lot::RwLock<F::Key>,
}

impl<F: KeyedPooledFactory> KeyBound<F> {
    fn current_key(&self) -> F::Key {
        self.key.read().clone()
    }

    fn rebind(&self, key: &F::Key) {
        *self.key.write() = key.clone();
    }
}

#[async_trait]
impl<F: KeyedPooledFactory> PooledFactory for KeyBound<F> {
    type Object = F::Object;

    async fn make_object(&self) -> PoolResult<Self::Object> {
        let key = self.current_key();
        self.factory.make_object(&key).await
    }

    async fn activate_object(&self, obj: &Self::Object) -> PoolResult<()> {
        let key = self.current_key();
        self.factory.activate_object(&key, obj).await
    }

    async fn passivate_object(&self, obj: &Self::Object) -> PoolResult<()> {
        let key = self.current_key();
        self.factory.passivate_object(&key, obj).await
    }

    async fn validate_object(&self, obj: &Self::Object) -> bool {
        let key = self.current_key();
        self.factory.validate_object(&key, obj).await
    }

    async fn destroy_object(&self, obj: Self::Object) -> PoolResult<()> {
        let key = self.current_key();
        self.factory.destroy_object(&key, obj).await
    }
}

/// Pool of pools, one sub-pool per key. All sub-pools share the same
/// [`PoolConfig`] (capacity limits apply per key).
pub struct KeyedObjectPool<F: KeyedPooledFactory> {
    factory: Arc<F>,
    config: PoolConfig,
    shards: DashMap<F::Key, ObjectPool<KeyBound<F>>>,
    closed: AtomicBool,
}

impl<F: KeyedPooledFactory> KeyedObjectPool<F> {
    /// Create a new keyed pool over `factory`.
    ///
    /// # Errors
    /// Returns an error if `config` is invalid.
    pub fn new(factory: Arc<F>, config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;
        Ok(Self {
            factory,
            config,
            shards: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Whether the pool has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The factory backing this pool.
    #[must_use]
    pub fn factory(&self) -> &Arc<F> {
        &self.factory
    }

    /// Borrow an object for `key`, creating the sub-pool on first use.
    pub async fn borrow_object(&self, key: &F::Key) -> PoolResult<F::Object> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let pool = self.sub_pool(key)?;
        // The shard guard was released by cloning; safe to await.
        pool.borrow_object().await
    }

    /// Return a borrowed object to `key`'s sub-pool.
    pub async fn return_object(&self, key: &F::Key, obj: F::Object) -> PoolResult<()> {
        let pool = self.existing_sub_pool(key)?;
        pool.return_object(obj).await
    }

    /// Destroy a borrowed object and free `key`'s capacity slot.
    pub async fn invalidate_object(&self, key: &F::Key, obj: F::Object) -> PoolResult<()> {
        let pool = self.existing_sub_pool(key)?;
        pool.invalidate_object(obj).await
    }

    /// Destroy the idle objects of `key`'s sub-pool. Other keys are
    /// untouched; checked-out objects are unaffected.
    pub async fn clear(&self, key: &F::Key) {
        let pool = self.shards.get(key).map(|entry| entry.value().clone());
        if let Some(pool) = pool {
            pool.clear().await;
        }
    }

    /// Destroy the idle objects of every sub-pool.
    pub async fn clear_all(&self) {
        for pool in self.all_sub_pools() {
            pool.clear().await;
        }
    }

    /// Close every sub-pool and fail all future borrows.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for pool in self.all_sub_pools() {
            pool.close().await;
        }
    }

    /// Run one eviction pass on every sub-pool.
    pub async fn evict(&self) {
        for pool in self.all_sub_pools() {
            pool.evict().await;
        }
    }

    /// Number of objects checked out for `key`.
    #[must_use]
    pub fn num_active(&self, key: &F::Key) -> usize {
        self.shards.get(key).map_or(0, |e| e.value().num_active())
    }

    /// Number of idle objects pooled for `key`.
    #[must_use]
    pub fn num_idle(&self, key: &F::Key) -> usize {
        self.shards.get(key).map_or(0, |e| e.value().num_idle())
    }

    /// Statistics for `key`'s sub-pool, if it exists.
    #[must_use]
    pub fn stats(&self, key: &F::Key) -> Option<PoolStats> {
        self.shards.get(key).map(|e| e.value().stats())
    }

    /// Keys that currently have a sub-pool.
    #[must_use]
    pub fn keys(&self) -> Vec<F::Key> {
        self.shards.iter().map(|e| e.key().clone()).collect()
    }

    /// Get or atomically create the sub-pool for `key`, rebinding it to
    /// the borrower's full key value.
    fn sub_pool(&self, key: &F::Key) -> PoolResult<ObjectPool<KeyBound<F>>> {
        if let Some(entry) = self.shards.get(key) {
            entry.value().factory().rebind(key);
            return Ok(entry.value().clone());
        }
        let entry = self.shards.entry(key.clone()).or_try_insert_with(|| {
            ObjectPool::new(
                Arc::new(KeyBound {
                    factory: Arc::clone(&self.factory),
                    key: parking_lot::RwLock::new(key.clone()),
                }),
                self.config.clone(),
            )
        })?;
        entry.value().factory().rebind(key);
        Ok(entry.value().clone())
    }

    fn existing_sub_pool(&self, key: &F::Key) -> PoolResult<ObjectPool<KeyBound<F>>> {
        self.shards
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or(PoolError::UnknownObject)
    }

    fn all_sub_pools(&self) -> Vec<ObjectPool<KeyBound<F>>> {
        // Clone out of the map so no shard lock is held across awaits.
        self.shards.iter().map(|e| e.value().clone()).collect()
    }
}

impl<F: KeyedPooledFactory> std::fmt::Debug for KeyedObjectPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedObjectPool")
            .field("keys", &self.shards.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    #[derive(Clone, Debug)]
    struct TestObject {
        id: u64,
        key: String,
    }

    impl Poolable for TestObject {
        fn identity(&self) -> u64 {
            self.id
        }
    }

    #[derive(Default)]
    struct TestFactory {
        counter: AtomicU64,
    }

    #[async_trait]
    impl KeyedPooledFactory for TestFactory {
        type Key = String;
        type Object = TestObject;

        async fn make_object(&self, key: &String) -> PoolResult<TestObject> {
            Ok(TestObject {
                id: self.counter.fetch_add(1, Ordering::SeqCst),
                key: key.clone(),
            })
        }

        async fn destroy_object(&self, _key: &String, _obj: TestObject) -> PoolResult<()> {
            Ok(())
        }
    }

    fn keyed_pool() -> KeyedObjectPool<TestFactory> {
        KeyedObjectPool::new(Arc::new(TestFactory::default()), PoolConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn keys_get_distinct_sub_pools() {
        let pool = keyed_pool();
        let a = pool.borrow_object(&"alice".to_string()).await.unwrap();
        let b = pool.borrow_object(&"bob".to_string()).await.unwrap();
        assert_eq!(a.key, "alice");
        assert_eq!(b.key, "bob");
        assert_eq!(pool.num_active(&"alice".to_string()), 1);
        assert_eq!(pool.num_active(&"bob".to_string()), 1);
    }

    #[tokio::test]
    async fn return_goes_to_owning_key() {
        let pool = keyed_pool();
        let key = "alice".to_string();
        let obj = pool.borrow_object(&key).await.unwrap();
        pool.return_object(&key, obj).await.unwrap();
        assert_eq!(pool.num_idle(&key), 1);
        assert_eq!(pool.num_idle(&"bob".to_string()), 0);
    }

    #[tokio::test]
    async fn clear_touches_only_that_key() {
        let pool = keyed_pool();
        let alice = "alice".to_string();
        let bob = "bob".to_string();
        let a = pool.borrow_object(&alice).await.unwrap();
        let b = pool.borrow_object(&bob).await.unwrap();
        pool.return_object(&alice, a).await.unwrap();
        pool.return_object(&bob, b).await.unwrap();

        pool.clear(&alice).await;
        assert_eq!(pool.num_idle(&alice), 0);
        assert_eq!(pool.num_idle(&bob), 1);
    }

    #[tokio::test]
    async fn racing_first_borrows_share_one_sub_pool() {
        let pool = Arc::new(keyed_pool());
        let key = "shared".to_string();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                pool.borrow_object(&key).await.unwrap()
            }));
        }
        let mut objs = Vec::new();
        for handle in handles {
            objs.push(handle.await.unwrap());
        }
        // One sub-pool, eight live objects in it.
        assert_eq!(pool.keys().len(), 1);
        assert_eq!(pool.num_active(&key), 8);
        for obj in objs {
            pool.return_object(&key, obj).await.unwrap();
        }
        assert_eq!(pool.num_idle(&key), 8);
    }

    #[tokio::test]
    async fn close_fails_future_borrows() {
        let pool = keyed_pool();
        let key = "alice".to_string();
        let obj = pool.borrow_object(&key).await.unwrap();
        pool.return_object(&key, obj).await.unwrap();

        pool.close().await;
        assert_eq!(pool.num_idle(&key), 0);
        assert!(matches!(
            pool.borrow_object(&key).await.unwrap_err(),
            PoolError::Closed
        ));
    }

    #[tokio::test]
    async fn per_key_capacity_is_independent() {
        let config = PoolConfig {
            max_total: 1,
            max_wait: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let pool = KeyedObjectPool::new(Arc::new(TestFactory::default()), config).unwrap();
        let _a = pool.borrow_object(&"alice".to_string()).await.unwrap();
        // alice is exhausted, bob is not.
        assert!(pool.borrow_object(&"alice".to_string()).await.is_err());
        assert!(pool.borrow_object(&"bob".to_string()).await.is_ok());
    }
}
