//! Shared data source: one credential-keyed pool serving every user.
//!
//! The pool key is the [`Credential`](cistern_credential::Credential)
//! itself — equal and hashed by username only — so a password rotation
//! replaces a user's sub-pool contents instead of creating a second pool
//! beside it. Authentication happens per borrow via the keyed factory;
//! no password is ever cached outside the key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use cistern_credential::Credential;
use cistern_pool::PoolConfig;

use crate::config::{ConnectionDefaults, FacadeConfig};
use crate::core::{self, LeasedConnection, PoolAccess, credential_from};
use crate::entry::PoolEntry;
use crate::error::{DataSourceError, DataSourceResult};
use crate::factory::{ManagedKeyedPool, PoolManager};
use crate::registry::{InstanceRegistry, PooledDataSource};
use crate::rotation::RetryPolicy;
use crate::source::ConnectionSource;
use crate::validator::ConnectionValidator;

/// A pooling data source sharing one keyed pool across all users.
pub struct SharedDataSource<S: ConnectionSource> {
    source: Arc<S>,
    config: RwLock<FacadeConfig>,
    /// Created once per facade, on first access; `OnceCell` serializes
    /// racing initializers.
    managed: tokio::sync::OnceCell<Arc<ManagedKeyedPool<S>>>,
    get_connection_called: AtomicBool,
    instance: OnceLock<(Arc<InstanceRegistry>, String)>,
}

impl<S: ConnectionSource> SharedDataSource<S> {
    /// Start building a shared data source.
    #[must_use]
    pub fn builder() -> SharedDataSourceBuilder<S> {
        SharedDataSourceBuilder::new()
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
        self.managed
            .get()
            .map_or(0, |m| m.pool().num_active(&user_key(username)))
    }

    /// Idle connections currently pooled for `username`.
    #[must_use]
    pub fn num_idle(&self, username: Option<&str>) -> usize {
        self.managed
            .get()
            .map_or(0, |m| m.pool().num_idle(&user_key(username)))
    }

    /// Destroy every idle connection; the pool stays usable.
    pub async fn clear(&self) {
        if let Some(managed) = self.managed.get() {
            managed.pool().clear_all().await;
        }
    }

    /// Close the pool and deregister from the instance registry.
    pub async fn close(&self) -> DataSourceResult<()> {
        if let Some(managed) = self.managed.get() {
            managed.pool().close().await;
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

    /// Replace the validation query. Fails once a connection was
    /// requested.
    pub fn set_validation_query(&self, query: Option<String>) -> DataSourceResult<()> {
        self.assert_initialization_allowed()?;
        self.config.write().validation_query = query;
        Ok(())
    }

    /// Replace the facade-wide connection defaults. Fails once a
    /// connection was requested.
    pub fn set_defaults(&self, defaults: ConnectionDefaults) -> DataSourceResult<()> {
        self.assert_initialization_allowed()?;
        self.config.write().defaults = defaults;
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

    async fn keyed_pool(&self) -> DataSourceResult<Arc<ManagedKeyedPool<S>>> {
        self.managed
            .get_or_try_init(|| async {
                let (validator, pool_config) = {
                    let config = self.config.read();
                    let validator = ConnectionValidator::new(
                        config.validation_query.clone(),
                        config.validation_timeout,
                        config.rollback_after_validation,
                        config.max_lifetime,
                    );
                    (validator, config.pool.clone())
                };
                ManagedKeyedPool::new(Arc::clone(&self.source), validator, pool_config)
            })
            .await
            .cloned()
    }
}

fn user_key(username: Option<&str>) -> Credential {
    match username {
        Some(name) => Credential::username_only(name),
        None => Credential::anonymous(),
    }
}

impl<S: ConnectionSource> PoolAccess<S> for SharedDataSource<S> {
    async fn borrow(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> DataSourceResult<PoolEntry<S::Conn>> {
        let managed = self.keyed_pool().await?;
        managed.ensure_healthy()?;
        let key = credential_from(username, password);
        managed.pool().borrow_object(&key).await.map_err(|e| {
            DataSourceError::acquisition_caused_by("could not retrieve connection from pool", e)
        })
    }

    async fn manager(&self, _username: Option<&str>) -> DataSourceResult<Arc<dyn PoolManager>> {
        let managed = self.keyed_pool().await?;
        Ok(managed as Arc<dyn PoolManager>)
    }

    fn defaults(&self, _username: Option<&str>) -> ConnectionDefaults {
        self.config.read().defaults
    }

    fn source(&self) -> &Arc<S> {
        &self.source
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.config.read().rotation_retry
    }
}

#[async_trait]
impl<S: ConnectionSource> PooledDataSource for SharedDataSource<S> {
    fn data_source_name(&self) -> Option<String> {
        self.config.read().data_source_name.clone()
    }

    async fn close(&self) -> DataSourceResult<()> {
        Self::close(self).await
    }
}

impl<S: ConnectionSource> std::fmt::Debug for SharedDataSource<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDataSource")
            .field("data_source_name", &self.config.read().data_source_name)
            .field("initialized", &self.managed.initialized())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`SharedDataSource`].
pub struct SharedDataSourceBuilder<S: ConnectionSource> {
    source: Option<Arc<S>>,
    source_conflict: bool,
    config: FacadeConfig,
    registry: Option<Arc<InstanceRegistry>>,
}

impl<S: ConnectionSource> SharedDataSourceBuilder<S> {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            source: None,
            source_conflict: false,
            config: FacadeConfig::default(),
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

    /// Label for the source.
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

    /// Pool settings (applied per credential key).
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

    /// Register the built facade in `registry`.
    #[must_use]
    pub fn instance_registry(mut self, registry: Arc<InstanceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the facade, validating the configuration.
    pub fn build(self) -> DataSourceResult<Arc<SharedDataSource<S>>> {
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

        let data_source = Arc::new(SharedDataSource {
            source,
            config: RwLock::new(self.config),
            managed: tokio::sync::OnceCell::new(),
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

impl<S: ConnectionSource> Default for SharedDataSourceBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}
