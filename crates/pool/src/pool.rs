//! Generic object pool with factory lifecycle callbacks.
//!
//! `ObjectPool<F>` calls `F::make_object`, `F::activate_object`,
//! `F::passivate_object`, `F::validate_object` and `F::destroy_object`
//! at the corresponding points of an object's life. Unlike an RAII-guard
//! pool, hand-out and return are explicit: the layer above decides when
//! an object comes back (e.g. on a connection-closed event), so the pool
//! tracks checked-out identities and rejects returns it never handed out.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::eviction::{DefaultEvictionPolicy, EvictionConfig, EvictionPolicy};
use crate::object::{PoolStats, Poolable};

/// Lifecycle callbacks supplied by the layer that owns the pooled
/// objects.
///
/// `validate_object` returns a plain boolean — validation failures are a
/// policy input, never an error. `destroy_object` failures are logged by
/// the pool and never propagate over the operation that triggered the
/// destroy.
#[async_trait]
pub trait PooledFactory: Send + Sync + 'static {
    /// The pooled object type.
    type Object: Poolable;

    /// Create a new object.
    async fn make_object(&self) -> PoolResult<Self::Object>;

    /// Prepare an object for hand-out. Failing means the pool discards
    /// the object instead of lending it.
    async fn activate_object(&self, _obj: &Self::Object) -> PoolResult<()> {
        Ok(())
    }

    /// Prepare an object for idling. Failing means the pool destroys
    /// the object instead of keeping it.
    async fn passivate_object(&self, _obj: &Self::Object) -> PoolResult<()> {
        Ok(())
    }

    /// Check whether an object is still usable.
    async fn validate_object(&self, _obj: &Self::Object) -> bool {
        true
    }

    /// Tear an object down when it is permanently removed.
    async fn destroy_object(&self, obj: Self::Object) -> PoolResult<()>;
}

/// An idle entry and the moment it went idle.
struct IdleEntry<T> {
    object: T,
    idle_since: Instant,
}

impl<T> IdleEntry<T> {
    fn new(object: T) -> Self {
        Self {
            object,
            idle_since: Instant::now(),
        }
    }
}

/// Inner shared state for the pool.
struct PoolInner<F: PooledFactory> {
    factory: Arc<F>,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleEntry<F::Object>>>,
    /// Identities of checked-out objects; guards against double returns.
    active: Mutex<HashSet<u64>>,
    stats: Mutex<PoolStats>,
    /// Each checked-out object holds one forgotten permit; returns and
    /// invalidations give it back. Idle objects hold none — every idle
    /// entry came from a return that already released its permit, which
    /// keeps active + idle bounded by max_total.
    semaphore: Semaphore,
    closed: AtomicBool,
    eviction_policy: Mutex<Arc<dyn EvictionPolicy>>,
    evictor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Generic bounded object pool.
pub struct ObjectPool<F: PooledFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: PooledFactory> Clone for ObjectPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Non-owning handle to an [`ObjectPool`].
///
/// Long-lived observers (e.g. an event-reclaim task) hold this instead of
/// a pool clone so they do not keep a retired pool alive.
pub struct WeakObjectPool<F: PooledFactory> {
    inner: std::sync::Weak<PoolInner<F>>,
}

impl<F: PooledFactory> Clone for WeakObjectPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: std::sync::Weak::clone(&self.inner),
        }
    }
}

impl<F: PooledFactory> WeakObjectPool<F> {
    /// Recover a usable pool handle, if the pool still exists.
    #[must_use]
    pub fn upgrade(&self) -> Option<ObjectPool<F>> {
        self.inner.upgrade().map(|inner| ObjectPool { inner })
    }
}

impl<F: PooledFactory> std::fmt::Debug for ObjectPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("stats", &self.stats())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl<F: PooledFactory> ObjectPool<F> {
    /// Create a new pool over `factory`.
    ///
    /// When `duration_between_eviction_runs` is configured the background
    /// evictor task is spawned immediately, so construction must happen
    /// inside a tokio runtime in that case.
    ///
    /// # Errors
    /// Returns an error if `config` is invalid.
    pub fn new(factory: Arc<F>, config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;
        let max = config.max_total;
        let interval = config.duration_between_eviction_runs;
        let pool = Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                idle: Mutex::new(VecDeque::with_capacity(max)),
                active: Mutex::new(HashSet::new()),
                stats: Mutex::new(PoolStats::default()),
                semaphore: Semaphore::new(max),
                closed: AtomicBool::new(false),
                eviction_policy: Mutex::new(Arc::new(DefaultEvictionPolicy)),
                evictor: Mutex::new(None),
            }),
        };
        if let Some(interval) = interval {
            let evictor_pool = pool.clone();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if evictor_pool.is_closed() {
                        break;
                    }
                    evictor_pool.evict().await;
                }
            });
            *pool.inner.evictor.lock() = Some(handle);
        }
        Ok(pool)
    }

    /// Replace the eviction policy used by [`evict`](Self::evict).
    pub fn set_eviction_policy(&self, policy: Arc<dyn EvictionPolicy>) {
        *self.inner.eviction_policy.lock() = policy;
    }

    /// Downgrade to a non-owning handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakObjectPool<F> {
        WeakObjectPool {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The factory backing this pool.
    #[must_use]
    pub fn factory(&self) -> &Arc<F> {
        &self.inner.factory
    }

    /// Whether the pool has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Borrow an object from the pool.
    ///
    /// Blocks (up to `max_wait`) when the pool is exhausted and
    /// `block_when_exhausted` is set; fails immediately otherwise.
    pub async fn borrow_object(&self) -> PoolResult<F::Object> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let permit = self.acquire_permit().await?;

        let object = loop {
            let entry = {
                let mut idle = inner.idle.lock();
                if inner.config.lifo {
                    idle.pop_back()
                } else {
                    idle.pop_front()
                }
            };
            match entry {
                Some(entry) => {
                    let obj = entry.object;
                    if inner.factory.activate_object(&obj).await.is_err() {
                        self.destroy(obj).await;
                        continue;
                    }
                    if inner.config.test_on_borrow && !inner.factory.validate_object(&obj).await {
                        self.destroy(obj).await;
                        continue;
                    }
                    break obj;
                }
                None => {
                    // No idle objects — create new. On failure the permit
                    // drops and capacity is restored.
                    let obj = inner.factory.make_object().await?;
                    inner.stats.lock().created += 1;
                    if let Err(e) = inner.factory.activate_object(&obj).await {
                        self.destroy(obj).await;
                        return Err(e);
                    }
                    if inner.config.test_on_create && !inner.factory.validate_object(&obj).await {
                        self.destroy(obj).await;
                        return Err(PoolError::factory(
                            "make_object",
                            "newly made object failed validation",
                        ));
                    }
                    break obj;
                }
            }
        };

        inner.active.lock().insert(object.identity());
        inner.stats.lock().borrowed += 1;
        permit.forget();
        Ok(object)
    }

    /// Return a borrowed object to the pool.
    ///
    /// # Errors
    /// [`PoolError::UnknownObject`] if the object is not currently
    /// checked out from this pool (including a second return of the same
    /// object).
    pub async fn return_object(&self, obj: F::Object) -> PoolResult<()> {
        let inner = &self.inner;
        if !inner.active.lock().remove(&obj.identity()) {
            return Err(PoolError::UnknownObject);
        }
        inner.stats.lock().returned += 1;

        let keep = !self.is_closed()
            && inner.factory.passivate_object(&obj).await.is_ok()
            && (!inner.config.test_on_return || inner.factory.validate_object(&obj).await)
            && inner.idle.lock().len() < inner.config.max_idle;

        if keep {
            inner.idle.lock().push_back(IdleEntry::new(obj));
        } else {
            self.destroy(obj).await;
        }
        inner.semaphore.add_permits(1);
        Ok(())
    }

    /// Destroy a borrowed object and free its capacity slot.
    ///
    /// # Errors
    /// [`PoolError::UnknownObject`] if the object is not currently
    /// checked out from this pool.
    pub async fn invalidate_object(&self, obj: F::Object) -> PoolResult<()> {
        let inner = &self.inner;
        if !inner.active.lock().remove(&obj.identity()) {
            return Err(PoolError::UnknownObject);
        }
        self.destroy(obj).await;
        inner.semaphore.add_permits(1);
        Ok(())
    }

    /// Destroy all idle objects. Checked-out objects are unaffected.
    pub async fn clear(&self) {
        let entries: Vec<_> = { self.inner.idle.lock().drain(..).collect() };
        for entry in entries {
            self.destroy(entry.object).await;
        }
    }

    /// Close the pool: stop the evictor, destroy idle objects, and fail
    /// all future borrows. Objects still checked out are destroyed as
    /// they come back.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.inner.evictor.lock().take() {
            handle.abort();
        }
        // Wake any borrower blocked on capacity; their acquire fails as
        // Closed instead of waiting out max_wait.
        self.inner.semaphore.close();
        self.clear().await;
    }

    /// Number of objects currently checked out.
    #[must_use]
    pub fn num_active(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Number of idle objects currently pooled.
    #[must_use]
    pub fn num_idle(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut stats = self.inner.stats.lock().clone();
        stats.active = self.num_active();
        stats.idle = self.num_idle();
        stats
    }

    /// Run one eviction pass: examine up to `num_tests_per_eviction_run`
    /// of the oldest idle objects, evict per the installed policy,
    /// revalidate survivors when `test_while_idle` is set, then top the
    /// pool back up to `min_idle`.
    pub async fn evict(&self) {
        let inner = &self.inner;
        let policy = Arc::clone(&inner.eviction_policy.lock());
        let eviction_config = EvictionConfig {
            idle_evict_duration: inner.config.min_evictable_idle,
            idle_soft_evict_duration: inner.config.soft_min_evictable_idle,
            min_idle: inner.config.min_idle,
        };

        let (candidates, mut idle_count) = {
            let mut idle = inner.idle.lock();
            let n = inner.config.num_tests_per_eviction_run.min(idle.len());
            let count = idle.len();
            let drained: Vec<_> = idle.drain(..n).collect();
            (drained, count)
        };

        let mut keepers = Vec::new();
        for entry in candidates {
            let idle_duration = entry.idle_since.elapsed();
            if policy.evict(&eviction_config, idle_duration, idle_count) {
                self.destroy(entry.object).await;
                idle_count -= 1;
                continue;
            }
            if inner.config.test_while_idle {
                let obj = &entry.object;
                let healthy = inner.factory.activate_object(obj).await.is_ok()
                    && inner.factory.validate_object(obj).await
                    && inner.factory.passivate_object(obj).await.is_ok();
                if !healthy {
                    self.destroy(entry.object).await;
                    idle_count -= 1;
                    continue;
                }
            }
            keepers.push(entry);
        }

        // Survivors are the oldest entries — put them back at the front
        // in their original order.
        {
            let mut idle = inner.idle.lock();
            for entry in keepers.into_iter().rev() {
                idle.push_front(entry);
            }
        }

        self.ensure_min_idle().await;
    }

    /// Create idle objects until `min_idle` is met or capacity runs out.
    /// A concurrent borrow can race this count — at worst the pool
    /// briefly overshoots by one idle object, which the next eviction
    /// run corrects.
    async fn ensure_min_idle(&self) {
        let inner = &self.inner;
        loop {
            if self.is_closed() || self.num_idle() >= inner.config.min_idle {
                return;
            }
            if self.num_active() + self.num_idle() >= inner.config.max_total {
                return;
            }
            match inner.factory.make_object().await {
                Ok(obj) => {
                    if inner.factory.passivate_object(&obj).await.is_err() {
                        self.destroy(obj).await;
                        return;
                    }
                    inner.stats.lock().created += 1;
                    inner.idle.lock().push_back(IdleEntry::new(obj));
                }
                Err(_) => return,
            }
        }
    }

    async fn acquire_permit(&self) -> PoolResult<tokio::sync::SemaphorePermit<'_>> {
        let inner = &self.inner;
        let exhausted = || PoolError::Exhausted {
            active: self.num_active(),
            max_total: inner.config.max_total,
        };
        if !inner.config.block_when_exhausted {
            return inner.semaphore.try_acquire().map_err(|_| exhausted());
        }
        let acquired = match inner.config.max_wait {
            Some(wait) => tokio::time::timeout(wait, inner.semaphore.acquire())
                .await
                .map_err(|_| exhausted())?,
            None => inner.semaphore.acquire().await,
        };
        acquired.map_err(|_| PoolError::Closed)
    }

    /// Destroy an object, containing any teardown failure.
    async fn destroy(&self, obj: F::Object) {
        if let Err(e) = self.inner.factory.destroy_object(obj).await {
            tracing::warn!(error = %e, "failed to destroy pooled object");
        }
        self.inner.stats.lock().destroyed += 1;
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
    }

    impl Poolable for TestObject {
        fn identity(&self) -> u64 {
            self.id
        }
    }

    #[derive(Default)]
    struct TestFactory {
        counter: AtomicU64,
        fail_validation: AtomicBool,
    }

    #[async_trait]
    impl PooledFactory for TestFactory {
        type Object = TestObject;

        async fn make_object(&self) -> PoolResult<TestObject> {
            Ok(TestObject {
                id: self.counter.fetch_add(1, Ordering::SeqCst),
            })
        }

        async fn validate_object(&self, _obj: &TestObject) -> bool {
            !self.fail_validation.load(Ordering::SeqCst)
        }

        async fn destroy_object(&self, _obj: TestObject) -> PoolResult<()> {
            Ok(())
        }
    }

    fn pool(config: PoolConfig) -> ObjectPool<TestFactory> {
        ObjectPool::new(Arc::new(TestFactory::default()), config).unwrap()
    }

    #[tokio::test]
    async fn borrow_creates_when_empty() {
        let pool = pool(PoolConfig::default());
        let obj = pool.borrow_object().await.unwrap();
        assert_eq!(obj.id, 0);
        assert_eq!(pool.num_active(), 1);
        assert_eq!(pool.num_idle(), 0);
    }

    #[tokio::test]
    async fn return_then_borrow_reuses() {
        let pool = pool(PoolConfig::default());
        let obj = pool.borrow_object().await.unwrap();
        pool.return_object(obj).await.unwrap();
        assert_eq!(pool.num_idle(), 1);

        let again = pool.borrow_object().await.unwrap();
        assert_eq!(again.id, 0, "idle object should be reused");
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test]
    async fn double_return_is_rejected() {
        let pool = pool(PoolConfig::default());
        let obj = pool.borrow_object().await.unwrap();
        pool.return_object(obj.clone()).await.unwrap();
        let err = pool.return_object(obj).await.unwrap_err();
        assert!(matches!(err, PoolError::UnknownObject));
        // The duplicate must not have corrupted the counters.
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(pool.num_active(), 0);
    }

    #[tokio::test]
    async fn foreign_object_return_is_rejected() {
        let pool = pool(PoolConfig::default());
        let err = pool.return_object(TestObject { id: 999 }).await.unwrap_err();
        assert!(matches!(err, PoolError::UnknownObject));
    }

    #[tokio::test]
    async fn exhaustion_times_out() {
        let config = PoolConfig {
            max_total: 1,
            max_wait: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let pool = pool(config);
        let _held = pool.borrow_object().await.unwrap();
        let err = pool.borrow_object().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn non_blocking_exhaustion_fails_fast() {
        let config = PoolConfig {
            max_total: 1,
            block_when_exhausted: false,
            ..Default::default()
        };
        let pool = pool(config);
        let _held = pool.borrow_object().await.unwrap();
        let started = Instant::now();
        let err = pool.borrow_object().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn capacity_freed_by_return() {
        let config = PoolConfig {
            max_total: 1,
            max_wait: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let pool = pool(config);
        let obj = pool.borrow_object().await.unwrap();
        pool.return_object(obj).await.unwrap();
        pool.borrow_object().await.unwrap();
    }

    #[tokio::test]
    async fn invalidate_frees_capacity() {
        let config = PoolConfig {
            max_total: 1,
            max_wait: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let pool = pool(config);
        let obj = pool.borrow_object().await.unwrap();
        pool.invalidate_object(obj).await.unwrap();
        assert_eq!(pool.stats().destroyed, 1);
        // The slot must be reusable.
        let next = pool.borrow_object().await.unwrap();
        assert_eq!(next.id, 1);
    }

    #[tokio::test]
    async fn test_on_borrow_discards_invalid_idle() {
        let factory = Arc::new(TestFactory::default());
        let config = PoolConfig {
            test_on_borrow: true,
            ..Default::default()
        };
        let pool = ObjectPool::new(Arc::clone(&factory), config).unwrap();

        let obj = pool.borrow_object().await.unwrap();
        pool.return_object(obj).await.unwrap();

        // Poison validation — the idle object must be discarded and a
        // fresh one created. A fresh object fails test_on_create only if
        // that flag is set, which it is not here.
        factory.fail_validation.store(true, Ordering::SeqCst);
        let fresh = pool.borrow_object().await.unwrap();
        assert_eq!(fresh.id, 1);
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[tokio::test]
    async fn lifo_hands_out_most_recent() {
        let pool = pool(PoolConfig::default());
        let a = pool.borrow_object().await.unwrap();
        let b = pool.borrow_object().await.unwrap();
        pool.return_object(a).await.unwrap(); // idle: [0]
        pool.return_object(b).await.unwrap(); // idle: [0, 1]

        let out = pool.borrow_object().await.unwrap();
        assert_eq!(out.id, 1, "LIFO should dispense the last return");
    }

    #[tokio::test]
    async fn fifo_hands_out_oldest() {
        let config = PoolConfig {
            lifo: false,
            ..Default::default()
        };
        let pool = pool(config);
        let a = pool.borrow_object().await.unwrap();
        let b = pool.borrow_object().await.unwrap();
        pool.return_object(a).await.unwrap();
        pool.return_object(b).await.unwrap();

        let out = pool.borrow_object().await.unwrap();
        assert_eq!(out.id, 0, "FIFO should dispense the first return");
    }

    #[tokio::test]
    async fn max_idle_overflow_is_destroyed() {
        let config = PoolConfig {
            max_idle: 1,
            ..Default::default()
        };
        let pool = pool(config);
        let a = pool.borrow_object().await.unwrap();
        let b = pool.borrow_object().await.unwrap();
        pool.return_object(a).await.unwrap();
        pool.return_object(b).await.unwrap();

        assert_eq!(pool.num_idle(), 1);
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[tokio::test]
    async fn close_destroys_idle_and_fails_borrows() {
        let pool = pool(PoolConfig::default());
        let obj = pool.borrow_object().await.unwrap();
        let held = pool.borrow_object().await.unwrap();
        pool.return_object(obj).await.unwrap();

        pool.close().await;
        assert_eq!(pool.num_idle(), 0);
        assert!(matches!(
            pool.borrow_object().await.unwrap_err(),
            PoolError::Closed
        ));

        // A checked-out object returned after close is destroyed, not pooled.
        pool.return_object(held).await.unwrap();
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.stats().destroyed, 2);
    }

    #[tokio::test]
    async fn evict_removes_expired_idle() {
        let config = PoolConfig {
            min_evictable_idle: Duration::from_millis(10),
            ..Default::default()
        };
        let pool = pool(config);
        let obj = pool.borrow_object().await.unwrap();
        pool.return_object(obj).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.evict().await;
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[tokio::test]
    async fn evict_tops_up_min_idle() {
        let config = PoolConfig {
            min_idle: 2,
            ..Default::default()
        };
        let pool = pool(config);
        pool.evict().await;
        assert_eq!(pool.num_idle(), 2);
    }
}
