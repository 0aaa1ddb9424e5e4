//! Pool factories, managed pools, and event-driven reclaim.
//!
//! Two factory variants exist: [`DedicatedFactory`] bakes one credential
//! into an unkeyed pool (the per-user topology) and [`KeyedFactory`]
//! authenticates per borrow from a credential key (the shared topology).
//! Both compose the same validation/lifetime logic and the same
//! registry/validating-set bookkeeping; neither inherits from the other.
//!
//! A [`ManagedPool`]/[`ManagedKeyedPool`] pairs a factory with its pool,
//! runs the event pump that reacts to connection lifecycle events, and
//! exposes the [`PoolManager`] capability the rotation protocol uses.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use cistern_credential::{Credential, SecretString};
use cistern_pool::{
    KeyedObjectPool, KeyedPooledFactory, ObjectPool, PoolConfig, PoolError, PoolResult,
    PooledFactory, WeakObjectPool,
};

use crate::entry::{PoolEntry, PoolEntryRegistry, ValidatingSet};
use crate::error::{DataSourceError, DataSourceResult};
use crate::source::{ConnectionEvent, ConnectionId, ConnectionSource, EventReceiver, EventSender};
use crate::source::{RawConnection, event_channel};
use crate::validator::ConnectionValidator;

/// Capability used by the facade during credential rotation: drop a
/// specific connection, reset the cached password, or retire a user's
/// pool.
#[async_trait]
pub trait PoolManager: Send + Sync {
    /// Destroy the pooled connection with this identity and update the
    /// pool's counters.
    async fn invalidate(&self, id: ConnectionId) -> DataSourceResult<()>;

    /// Install a new password for future connection creation. The keyed
    /// variant never caches a password, so this is a no-op there.
    fn set_password(&self, password: Option<SecretString>);

    /// Retire pooled connections belonging to `username`.
    async fn close_pool(&self, username: Option<&str>) -> DataSourceResult<()>;
}

// ---------------------------------------------------------------------------
// Shared factory state
// ---------------------------------------------------------------------------

/// Bookkeeping both factory variants compose: the entry registry, the
/// validating set, the validator, and the event sender wired into every
/// connection this factory creates.
pub(crate) struct FactoryShared<C: RawConnection> {
    pub(crate) registry: PoolEntryRegistry<C>,
    pub(crate) validating: ValidatingSet,
    pub(crate) validator: ConnectionValidator,
    pub(crate) events: EventSender,
    /// Set when a lifecycle event arrives for an untracked connection —
    /// an invariant violation that must not be silently swallowed.
    poisoned: Mutex<Option<String>>,
}

impl<C: RawConnection> FactoryShared<C> {
    fn new(validator: ConnectionValidator, events: EventSender) -> Self {
        Self {
            registry: PoolEntryRegistry::new(),
            validating: ValidatingSet::new(),
            validator,
            events,
            poisoned: Mutex::new(None),
        }
    }

    /// Record an unknown-connection invariant violation.
    fn poison(&self, id: ConnectionId) {
        tracing::error!(
            connection = %id,
            "lifecycle event for a connection with no tracked pool entry"
        );
        *self.poisoned.lock() = Some(format!("no pooled entry recorded for connection {id}"));
    }

    /// Fail once the factory has observed an invariant violation.
    pub(crate) fn health(&self) -> DataSourceResult<()> {
        match &*self.poisoned.lock() {
            Some(message) => Err(DataSourceError::internal(message.clone())),
            None => Ok(()),
        }
    }

    /// Lifetime check shared by activate and passivate.
    fn check_lifetime(&self, entry: &PoolEntry<C>, operation: &'static str) -> PoolResult<()> {
        self.validator
            .check_lifetime(entry.age())
            .map_err(|e| PoolError::factory(operation, e))
    }

    /// Detach, deregister, and close an entry's connection.
    async fn destroy_entry(&self, entry: PoolEntry<C>) -> PoolResult<()> {
        let conn = Arc::clone(entry.conn());
        conn.events().detach();
        self.registry.remove(conn.id());
        conn.close()
            .await
            .map_err(|e| PoolError::factory("destroy_object", e))
    }

    /// Destroy outside pool management, containing every failure.
    async fn force_destroy(&self, entry: PoolEntry<C>) {
        let id = entry.conn().id();
        if let Err(e) = self.destroy_entry(entry).await {
            tracing::warn!(connection = %id, error = %e, "failed to destroy connection");
        }
    }
}

/// Wire a fresh connection into the factory's tracking structures.
fn register_connection<C: RawConnection>(
    shared: &FactoryShared<C>,
    conn: Arc<C>,
    credential: Credential,
) -> PoolEntry<C> {
    conn.events().attach(shared.events.clone());
    let entry = PoolEntry::new(conn, credential);
    shared.registry.insert(entry.clone());
    entry
}

// ---------------------------------------------------------------------------
// DedicatedFactory — one credential, one pool
// ---------------------------------------------------------------------------

/// Factory for a pool dedicated to a single credential.
///
/// The credential is replaceable ([`PoolManager::set_password`]) so a
/// rotation can redirect future creations without rebuilding the pool.
pub struct DedicatedFactory<S: ConnectionSource> {
    source: Arc<S>,
    credential: RwLock<Credential>,
    shared: FactoryShared<S::Conn>,
}

impl<S: ConnectionSource> DedicatedFactory<S> {
    fn new(
        source: Arc<S>,
        credential: Credential,
        validator: ConnectionValidator,
        events: EventSender,
    ) -> Self {
        Self {
            source,
            credential: RwLock::new(credential),
            shared: FactoryShared::new(validator, events),
        }
    }

    pub(crate) fn shared(&self) -> &FactoryShared<S::Conn> {
        &self.shared
    }

    /// Username this factory authenticates as.
    #[must_use]
    pub fn username(&self) -> Option<String> {
        self.credential.read().username().map(str::to_owned)
    }
}

#[async_trait]
impl<S: ConnectionSource> PooledFactory for DedicatedFactory<S> {
    type Object = PoolEntry<S::Conn>;

    async fn make_object(&self) -> PoolResult<Self::Object> {
        let credential = self.credential.read().clone();
        let conn = self
            .source
            .connect(&credential)
            .await
            .map_err(|e| PoolError::factory("make_object", e))?;
        Ok(register_connection(&self.shared, conn, credential))
    }

    async fn activate_object(&self, entry: &Self::Object) -> PoolResult<()> {
        self.shared.check_lifetime(entry, "activate_object")
    }

    async fn passivate_object(&self, entry: &Self::Object) -> PoolResult<()> {
        self.shared.check_lifetime(entry, "passivate_object")
    }

    async fn validate_object(&self, entry: &Self::Object) -> bool {
        self.shared
            .validator
            .validate(entry, &self.shared.validating)
            .await
    }

    async fn destroy_object(&self, entry: Self::Object) -> PoolResult<()> {
        self.shared.destroy_entry(entry).await
    }
}

// ---------------------------------------------------------------------------
// KeyedFactory — credential key per borrow
// ---------------------------------------------------------------------------

/// Factory for a shared pool keyed by [`Credential`].
///
/// Never caches a password: every creation authenticates with the key the
/// borrower supplied (key identity is username-only, so rotated passwords
/// reuse the same sub-pool).
pub struct KeyedFactory<S: ConnectionSource> {
    source: Arc<S>,
    shared: FactoryShared<S::Conn>,
}

impl<S: ConnectionSource> KeyedFactory<S> {
    fn new(source: Arc<S>, validator: ConnectionValidator, events: EventSender) -> Self {
        Self {
            source,
            shared: FactoryShared::new(validator, events),
        }
    }

    pub(crate) fn shared(&self) -> &FactoryShared<S::Conn> {
        &self.shared
    }
}

#[async_trait]
impl<S: ConnectionSource> KeyedPooledFactory for KeyedFactory<S> {
    type Key = Credential;
    type Object = PoolEntry<S::Conn>;

    async fn make_object(&self, key: &Credential) -> PoolResult<Self::Object> {
        let conn = self
            .source
            .connect(key)
            .await
            .map_err(|e| PoolError::factory("make_object", e))?;
        Ok(register_connection(&self.shared, conn, key.clone()))
    }

    async fn activate_object(&self, _key: &Credential, entry: &Self::Object) -> PoolResult<()> {
        self.shared.check_lifetime(entry, "activate_object")
    }

    async fn passivate_object(&self, _key: &Credential, entry: &Self::Object) -> PoolResult<()> {
        self.shared.check_lifetime(entry, "passivate_object")
    }

    async fn validate_object(&self, _key: &Credential, entry: &Self::Object) -> bool {
        self.shared
            .validator
            .validate(entry, &self.shared.validating)
            .await
    }

    async fn destroy_object(&self, _key: &Credential, entry: Self::Object) -> PoolResult<()> {
        self.shared.destroy_entry(entry).await
    }
}

// ---------------------------------------------------------------------------
// Event reclaim
// ---------------------------------------------------------------------------

/// How the pump hands an entry back to its pool.
enum Reclaim {
    Returned,
    Failed(PoolError),
}

/// React to one lifecycle event. Common to both pool topologies; the
/// `give_back`/`drop_entry` closures capture the topology-specific pool
/// calls.
async fn handle_event<C, RF, IF>(
    shared: &FactoryShared<C>,
    id: ConnectionId,
    event: ConnectionEvent,
    give_back: RF,
    drop_entry: IF,
) where
    C: RawConnection,
    RF: AsyncFnOnce(PoolEntry<C>) -> Reclaim,
    IF: AsyncFnOnce(PoolEntry<C>) -> Reclaim,
{
    match event {
        ConnectionEvent::Closed => {
            // A close fired by the validation probe itself: the validator
            // still owns the connection, the client did not release it.
            if shared.validating.contains(id) {
                return;
            }
            let Some(entry) = shared.registry.get(id) else {
                shared.poison(id);
                return;
            };
            if let Reclaim::Failed(e) = give_back(entry.clone()).await {
                tracing::warn!(
                    connection = %id,
                    error = %e,
                    "closing connection that could not be returned to the pool"
                );
                shared.force_destroy(entry).await;
            }
        }
        ConnectionEvent::Error { message } => {
            tracing::warn!(connection = %id, error = %message, "connection reported a fatal error");
            let Some(entry) = shared.registry.get(id) else {
                shared.poison(id);
                return;
            };
            // Detach first so no further reclaim is attempted for this
            // connection, whether or not a close event also fires.
            entry.conn().events().detach();
            if let Reclaim::Failed(e) = drop_entry(entry).await {
                tracing::warn!(connection = %id, error = %e, "could not invalidate errored connection");
            }
        }
    }
}

fn reclaim(result: PoolResult<()>) -> Reclaim {
    match result {
        Ok(()) => Reclaim::Returned,
        Err(e) => Reclaim::Failed(e),
    }
}

// ---------------------------------------------------------------------------
// ManagedPool — dedicated factory + pool + pump
// ---------------------------------------------------------------------------

/// A dedicated pool paired with its factory and reclaim pump.
pub struct ManagedPool<S: ConnectionSource> {
    factory: Arc<DedicatedFactory<S>>,
    pool: ObjectPool<DedicatedFactory<S>>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<S: ConnectionSource> ManagedPool<S> {
    /// Build the factory/pool pair and start its event pump.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        source: Arc<S>,
        credential: Credential,
        validator: ConnectionValidator,
        pool_config: PoolConfig,
    ) -> DataSourceResult<Arc<Self>> {
        let (tx, rx) = event_channel();
        let factory = Arc::new(DedicatedFactory::new(source, credential, validator, tx));
        let pool = ObjectPool::new(Arc::clone(&factory), pool_config)?;
        let pump = tokio::spawn(run_pump(rx, Arc::downgrade(&factory), pool.downgrade()));
        Ok(Arc::new(Self {
            factory,
            pool,
            pump: Mutex::new(Some(pump)),
        }))
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &ObjectPool<DedicatedFactory<S>> {
        &self.pool
    }

    /// The factory driving the pool.
    #[must_use]
    pub fn factory(&self) -> &Arc<DedicatedFactory<S>> {
        &self.factory
    }

    /// Fail once the factory has observed an invariant violation.
    pub fn ensure_healthy(&self) -> DataSourceResult<()> {
        self.factory.shared.health()
    }
}

impl<S: ConnectionSource> Drop for ManagedPool<S> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

async fn run_pump<S: ConnectionSource>(
    mut rx: EventReceiver,
    factory: Weak<DedicatedFactory<S>>,
    pool: WeakObjectPool<DedicatedFactory<S>>,
) {
    while let Some((id, event)) = rx.recv().await {
        let (Some(factory), Some(pool)) = (factory.upgrade(), pool.upgrade()) else {
            break;
        };
        let return_pool = pool.clone();
        let invalidate_pool = pool;
        handle_event(
            &factory.shared,
            id,
            event,
            async |entry| reclaim(return_pool.return_object(entry).await),
            async |entry| reclaim(invalidate_pool.invalidate_object(entry).await),
        )
        .await;
    }
}

#[async_trait]
impl<S: ConnectionSource> PoolManager for ManagedPool<S> {
    async fn invalidate(&self, id: ConnectionId) -> DataSourceResult<()> {
        let entry = self
            .factory
            .shared
            .registry
            .get(id)
            .ok_or(DataSourceError::UnknownConnection { id })?;
        // Close the pool first so no replacement is created under the
        // stale credential, then drop the specific entry. Checked-out
        // entries are destroyed as they come back.
        self.pool.close().await;
        self.pool.invalidate_object(entry).await?;
        Ok(())
    }

    fn set_password(&self, password: Option<SecretString>) {
        let mut credential = self.factory.credential.write();
        let updated = credential.with_password(password);
        *credential = updated;
    }

    async fn close_pool(&self, username: Option<&str>) -> DataSourceResult<()> {
        let matches = {
            let credential = self.factory.credential.read();
            credential.username() == username
        };
        if matches {
            self.pool.close().await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ManagedKeyedPool — keyed factory + keyed pool + pump
// ---------------------------------------------------------------------------

/// A credential-keyed pool paired with its factory and reclaim pump.
pub struct ManagedKeyedPool<S: ConnectionSource> {
    factory: Arc<KeyedFactory<S>>,
    pool: Arc<KeyedObjectPool<KeyedFactory<S>>>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<S: ConnectionSource> ManagedKeyedPool<S> {
    /// Build the factory/pool pair and start its event pump.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        source: Arc<S>,
        validator: ConnectionValidator,
        pool_config: PoolConfig,
    ) -> DataSourceResult<Arc<Self>> {
        let (tx, rx) = event_channel();
        let factory = Arc::new(KeyedFactory::new(source, validator, tx));
        let pool = Arc::new(KeyedObjectPool::new(Arc::clone(&factory), pool_config)?);
        let pump = tokio::spawn(run_keyed_pump(
            rx,
            Arc::downgrade(&factory),
            Arc::downgrade(&pool),
        ));
        Ok(Arc::new(Self {
            factory,
            pool,
            pump: Mutex::new(Some(pump)),
        }))
    }

    /// The underlying keyed pool.
    #[must_use]
    pub fn pool(&self) -> &KeyedObjectPool<KeyedFactory<S>> {
        &self.pool
    }

    /// The factory driving the pool.
    #[must_use]
    pub fn factory(&self) -> &Arc<KeyedFactory<S>> {
        &self.factory
    }

    /// Fail once the factory has observed an invariant violation.
    pub fn ensure_healthy(&self) -> DataSourceResult<()> {
        self.factory.shared.health()
    }
}

impl<S: ConnectionSource> Drop for ManagedKeyedPool<S> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

async fn run_keyed_pump<S: ConnectionSource>(
    mut rx: EventReceiver,
    factory: Weak<KeyedFactory<S>>,
    pool: Weak<KeyedObjectPool<KeyedFactory<S>>>,
) {
    while let Some((id, event)) = rx.recv().await {
        let (Some(factory), Some(pool)) = (factory.upgrade(), pool.upgrade()) else {
            break;
        };
        let return_pool = Arc::clone(&pool);
        handle_event(
            &factory.shared,
            id,
            event,
            async move |entry: PoolEntry<S::Conn>| {
                let key = entry.credential().clone();
                reclaim(return_pool.return_object(&key, entry).await)
            },
            async move |entry: PoolEntry<S::Conn>| {
                let key = entry.credential().clone();
                reclaim(pool.invalidate_object(&key, entry).await)
            },
        )
        .await;
    }
}

#[async_trait]
impl<S: ConnectionSource> PoolManager for ManagedKeyedPool<S> {
    async fn invalidate(&self, id: ConnectionId) -> DataSourceResult<()> {
        let entry = self
            .factory
            .shared
            .registry
            .get(id)
            .ok_or(DataSourceError::UnknownConnection { id })?;
        let key = entry.credential().clone();
        self.pool.invalidate_object(&key, entry).await?;
        // Idle entries under the same key share the stale password; other
        // keys are untouched.
        self.pool.clear(&key).await;
        Ok(())
    }

    fn set_password(&self, _password: Option<SecretString>) {
        // The key carries the password per borrow; nothing is cached here.
    }

    async fn close_pool(&self, username: Option<&str>) -> DataSourceResult<()> {
        let key = match username {
            Some(name) => Credential::username_only(name),
            None => Credential::anonymous(),
        };
        self.pool.clear(&key).await;
        Ok(())
    }
}
