//! Per-user data source: one dedicated pool per username.
//!
//! Some settings can be overridden for individual users, so a pool of
//! admin or write-access connections can be sized and tuned separately
//! from read-only users sharing the same facade. Passwords can change
//! without re-initializing the facade: a borrow with a newly valid
//! password retires the user's pool and rebuilds it, leaving every other
//! user's pool untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use cistern_pool::{PoolConfig, PoolError};

use crate::config::{ConnectionDefaults, FacadeConfig, PerUserOverrides};
use crate::core::{self, LeasedConnection, PoolAccess, credential_from};
use crate::entry::PoolEntry;
use crate::error::{DataSourceError, DataSourceResult};
use crate::factory::{ManagedPool, PoolManager};
use crate::registry::{InstanceRegistry, PooledDataSource};
use crate::rotation::RetryPolicy;
use crate::source::{ConnectionSource, RawConnection};
use crate::validator::ConnectionValidator;

/// Identity of one user's pool: the source label plus the username.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// The facade's configured source label.
    pub data_source_name: Option<String>,
    /// The username the pool authenticates as.
    pub username: Option<String>,
}

/// A pooling data source maintaining one dedicated pool per username.
pub struct PerUserDataSource<S: ConnectionSource> {
    source: Arc<S>,
    config: RwLock<FacadeConfig>,
    per_user: RwLock<HashMap<String, PerUserOverrides>>,
    managers: RwLock<HashMap<PoolKey, Arc<ManagedPool<S>>>>,
    /// Serializes pool creation: racing first accesses for one key must
    /// never build two pools.
    registration: tokio::sync::Mutex<()>,
    get_connection_called: AtomicBool,
    instance: OnceLock<(Arc<InstanceRegistry>, String)>,
}

impl<S: ConnectionSource> PerUserDataSource<S> {
    /// Start building a per-user data source.
    #[must_use]
    pub fn builder() -> PerUserDataSourceBuilder<S> {
        PerUserDataSourceBuilder::new()
    }

    /// Acquire a connection under the source's default identity.
    pub async fn get_connection(&self) -> DataSourceResult<LeasedConnection<S::Conn>> {
        self.get_connection_inner(None, None).await
    }

    /// Acquire a connection authenticated as `username`.
    pub async fn get_connection_as(
        &self,
        username: &str,
        password: &str,
    ) -> DataSourceResult<LeasedConnection<S::Conn>> {
        self.get_connection_inner(Some(username), Some(password))
            .await
    }

    async fn get_connection_inner(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> DataSourceResult<LeasedConnection<S::Conn>> {
        self.get_connection_called.store(true, Ordering::Release);
        core::acquire(self, username, password).await
    }

    /// Connections currently checked out for `username`.
    #[must_use]
    pub fn num_active(&self, username: Option<&str>) -> usize {
        let key = self.pool_key(username);
        self.managers
            .read()
            .get(&key)
            .map_or(0, |m| m.pool().num_active())
    }

    /// Idle connections currently pooled for `username`.
    #[must_use]
    pub fn num_idle(&self, username: Option<&str>) -> usize {
        let key = self.pool_key(username);
        self.managers
            .read()
            .get(&key)
            .map_or(0, |m| m.pool().num_idle())
    }

    /// Destroy the idle connections of every user's pool. The pools
    /// themselves stay usable.
    pub async fn clear(&self) {
        for manager in self.all_managers() {
            manager.pool().clear().await;
        }
    }

    /// Close every pool and deregister from the instance registry.
    pub async fn close(&self) -> DataSourceResult<()> {
        for manager in self.all_managers() {
            manager.pool().close().await;
        }
        if let Some((registry, key)) = self.instance.get() {
            registry.remove(key);
        }
        Ok(())
    }

    /// The key this facade was registered under, if any.
    #[must_use]
    pub fn instance_key(&self) -> Option<&str> {
        self.instance.get().map(|(_, key)| key.as_str())
    }

    // -- mutable settings (all fail once a connection was requested) --

    /// Replace the validation query.
    pub fn set_validation_query(&self, query: Option<String>) -> DataSourceResult<()> {
        self.assert_initialization_allowed()?;
        self.config.write().validation_query = query;
        Ok(())
    }

    /// Replace the rollback-after-validation flag.
    pub fn set_rollback_after_validation(&self, rollback: bool) -> DataSourceResult<()> {
        self.assert_initialization_allowed()?;
        self.config.write().rollback_after_validation = rollback;
        Ok(())
    }

    /// Replace the maximum connection lifetime.
    pub fn set_max_lifetime(&self, max_lifetime: Option<Duration>) -> DataSourceResult<()> {
        self.assert_initialization_allowed()?;
        self.config.write().max_lifetime = max_lifetime;
        Ok(())
    }

    /// Replace the facade-wide connection defaults.
    pub fn set_defaults(&self, defaults: ConnectionDefaults) -> DataSourceResult<()> {
        self.assert_initialization_allowed()?;
        self.config.write().defaults = defaults;
        Ok(())
    }

    /// Install overrides for one user.
    pub fn set_per_user(
        &self,
        username: &str,
        overrides: PerUserOverrides,
    ) -> DataSourceResult<()> {
        self.assert_initialization_allowed()?;
        self.per_user.write().insert(username.to_string(), overrides);
        Ok(())
    }

    fn assert_initialization_allowed(&self) -> DataSourceResult<()> {
        if self.get_connection_called.load(Ordering::Acquire) {
            return Err(DataSourceError::configuration(
                "a connection was already requested from this data source; \
                 further initialization is not allowed",
            ));
        }
        Ok(())
    }

    fn pool_key(&self, username: Option<&str>) -> PoolKey {
        PoolKey {
            data_source_name: self.config.read().data_source_name.clone(),
            username: username.map(str::to_owned),
        }
    }

    fn all_managers(&self) -> Vec<Arc<ManagedPool<S>>> {
        self.managers.read().values().cloned().collect()
    }

    /// Get the user's pool manager, creating the pool on first access.
    async fn manager_for(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> DataSourceResult<Arc<ManagedPool<S>>> {
        let key = self.pool_key(username);
        if let Some(manager) = self.managers.read().get(&key) {
            return Ok(Arc::clone(manager));
        }
        let _creation = self.registration.lock().await;
        // Re-check: another task may have registered while we waited.
        if let Some(manager) = self.managers.read().get(&key) {
            return Ok(Arc::clone(manager));
        }
        let manager = self.register_pool(username, password).await?;
        self.managers.write().insert(key, Arc::clone(&manager));
        Ok(manager)
    }

    async fn register_pool(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> DataSourceResult<Arc<ManagedPool<S>>> {
        let credential = credential_from(username, password);
        // Probe before building anything: a pool must never come into
        // existence for credentials the backend rejects.
        let probe = self.source.connect(&credential).await.map_err(|e| {
            DataSourceError::acquisition_caused_by("backend rejected credentials", e)
        })?;
        let _ = probe.close().await;

        let (validator, pool_config) = {
            let config = self.config.read();
            let overrides = username
                .and_then(|user| self.per_user.read().get(user).cloned())
                .unwrap_or_default();
            let validator = ConnectionValidator::new(
                config.validation_query.clone(),
                config.validation_timeout,
                config.rollback_after_validation,
                config.max_lifetime,
            );
            (validator, overrides.apply_to(&config.pool))
        };
        ManagedPool::new(Arc::clone(&self.source), credential, validator, pool_config)
    }
}

impl<S: ConnectionSource> PoolAccess<S> for PerUserDataSource<S> {
    async fn borrow(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> DataSourceResult<PoolEntry<S::Conn>> {
        let manager = self.manager_for(username, password).await?;
        manager.ensure_healthy()?;
        match manager.pool().borrow_object().await {
            Ok(entry) => Ok(entry),
            Err(e @ PoolError::Exhausted { .. }) => Err(DataSourceError::acquisition_caused_by(
                "could not retrieve connection from pool",
                e,
            )),
            Err(borrow_err) => {
                // The borrow failed for a non-capacity reason — possibly
                // the pool's cached password went stale. Probe with the
                // caller's credentials to find out.
                match self
                    .source
                    .connect(&credential_from(username, password))
                    .await
                {
                    Ok(probe) => {
                        let _ = probe.close().await;
                    }
                    Err(_) => {
                        return Err(DataSourceError::acquisition_caused_by(
                            "could not retrieve connection from pool",
                            borrow_err,
                        ));
                    }
                }
                // The caller's credentials work: retire the user's pool
                // and rebuild it under the new password.
                manager.close_pool(username).await?;
                {
                    let mut managers = self.managers.write();
                    managers.remove(&self.pool_key(username));
                }
                let fresh = self.manager_for(username, password).await?;
                fresh.pool().borrow_object().await.map_err(|e| {
                    DataSourceError::acquisition_caused_by(
                        "could not retrieve connection from pool",
                        e,
                    )
                })
            }
        }
    }

    async fn manager(&self, username: Option<&str>) -> DataSourceResult<Arc<dyn PoolManager>> {
        let key = self.pool_key(username);
        self.managers
            .read()
            .get(&key)
            .map(|m| Arc::clone(m) as Arc<dyn PoolManager>)
            .ok_or_else(|| DataSourceError::internal("no pool registered for this user"))
    }

    fn defaults(&self, username: Option<&str>) -> ConnectionDefaults {
        let facade_defaults = self.config.read().defaults;
        let user_defaults = username
            .and_then(|user| self.per_user.read().get(user).map(|o| o.defaults))
            .unwrap_or_default();
        facade_defaults.overridden_by(user_defaults)
    }

    fn source(&self) -> &Arc<S> {
        &self.source
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.config.read().rotation_retry
    }
}

#[async_trait]
impl<S: ConnectionSource> PooledDataSource for PerUserDataSource<S> {
    fn data_source_name(&self) -> Option<String> {
        self.config.read().data_source_name.clone()
    }

    async fn close(&self) -> DataSourceResult<()> {
        Self::close(self).await
    }
}

impl<S: ConnectionSource> std::fmt::Debug for PerUserDataSource<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerUserDataSource")
            .field("data_source_name", &self.config.read().data_source_name)
            .field("pools", &self.managers.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`PerUserDataSource`].
pub struct PerUserDataSourceBuilder<S: ConnectionSource> {
    source: Option<Arc<S>>,
    source_conflict: bool,
    config: FacadeConfig,
    per_user: HashMap<String, PerUserOverrides>,
    registry: Option<Arc<InstanceRegistry>>,
}

impl<S: ConnectionSource> PerUserDataSourceBuilder<S> {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            source: None,
            source_conflict: false,
            config: FacadeConfig::default(),
            per_user: HashMap::new(),
            registry: None,
        }
    }

    /// The connection source to pool. Required; setting it twice is a
    /// configuration conflict reported at build time.
    #[must_use]
    pub fn source(mut self, source: Arc<S>) -> Self {
        if self.source.is_some() {
            self.source_conflict = true;
        }
        self.source = Some(source);
        self
    }

    /// Label for the source; becomes part of every pool key.
    #[must_use]
    pub fn data_source_name(mut self, name: impl Into<String>) -> Self {
        self.config.data_source_name = Some(name.into());
        self
    }

    /// Validation query (`None` keeps the native check).
    #[must_use]
    pub fn validation_query(mut self, query: impl Into<String>) -> Self {
        self.config.validation_query = Some(query.into());
        self
    }

    /// Bound on validation probes.
    #[must_use]
    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.config.validation_timeout = Some(timeout);
        self
    }

    /// Issue a rollback after query-based validation.
    #[must_use]
    pub fn rollback_after_validation(mut self, rollback: bool) -> Self {
        self.config.rollback_after_validation = rollback;
        self
    }

    /// Maximum permitted connection lifetime.
    #[must_use]
    pub fn max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.config.max_lifetime = Some(max_lifetime);
        self
    }

    /// Facade-wide connection defaults.
    #[must_use]
    pub fn defaults(mut self, defaults: ConnectionDefaults) -> Self {
        self.config.defaults = defaults;
        self
    }

    /// Pool settings used for every user's pool.
    #[must_use]
    pub fn pool_config(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    /// Retry bound for the rotation loop.
    #[must_use]
    pub fn rotation_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.rotation_retry = policy;
        self
    }

    /// Overrides for one user.
    #[must_use]
    pub fn per_user(mut self, username: impl Into<String>, overrides: PerUserOverrides) -> Self {
        self.per_user.insert(username.into(), overrides);
        self
    }

    /// Register the built facade in `registry`.
    #[must_use]
    pub fn instance_registry(mut self, registry: Arc<InstanceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the facade, validating the configuration.
    pub fn build(self) -> DataSourceResult<Arc<PerUserDataSource<S>>> {
        if self.source_conflict {
            return Err(DataSourceError::configuration(
                "connection source was configured twice",
            ));
        }
        let source = self.source.ok_or_else(|| {
            DataSourceError::configuration("a connection source must be configured")
        })?;
        self.config
            .pool
            .validate()
            .map_err(|e| DataSourceError::configuration(e.to_string()))?;

        let data_source = Arc::new(PerUserDataSource {
            source,
            config: RwLock::new(self.config),
            per_user: RwLock::new(self.per_user),
            managers: RwLock::new(HashMap::new()),
            registration: tokio::sync::Mutex::new(()),
            get_connection_called: AtomicBool::new(false),
            instance: OnceLock::new(),
        });
        if let Some(registry) = self.registry {
            let key = registry.register(Arc::clone(&data_source) as Arc<dyn PooledDataSource>);
            let _ = data_source.instance.set((registry, key));
        }
        Ok(data_source)
    }
}

impl<S: ConnectionSource> Default for PerUserDataSourceBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}
