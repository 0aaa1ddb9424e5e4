//! Facade-level configuration: validation settings, connection defaults,
//! pool defaults, and per-user overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use cistern_pool::PoolConfig;

use crate::rotation::RetryPolicy;
use crate::source::IsolationLevel;

/// Connection attributes applied to every connection before hand-out.
/// `None` fields leave the backend's own default untouched.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConnectionDefaults {
    /// Default auto-commit mode.
    pub auto_commit: Option<bool>,
    /// Default read-only mode.
    pub read_only: Option<bool>,
    /// Default transaction isolation level.
    pub transaction_isolation: Option<IsolationLevel>,
}

impl ConnectionDefaults {
    /// Layer `over` on top of `self`: any field set in `over` wins.
    #[must_use]
    pub fn overridden_by(self, over: Self) -> Self {
        Self {
            auto_commit: over.auto_commit.or(self.auto_commit),
            read_only: over.read_only.or(self.read_only),
            transaction_isolation: over.transaction_isolation.or(self.transaction_isolation),
        }
    }
}

/// Facade-wide settings shared by both data-source variants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FacadeConfig {
    /// Label of the underlying source; part of the per-user pool key.
    pub data_source_name: Option<String>,
    /// Validation query; `None` means the connection's native check.
    /// When set, it must produce at least one row on a healthy connection.
    pub validation_query: Option<String>,
    /// Bound on a validation probe. `None`/zero leaves it to the backend.
    pub validation_timeout: Option<Duration>,
    /// Issue a rollback after a query-based validation, undoing any side
    /// effects or locks the query acquired.
    pub rollback_after_validation: bool,
    /// Maximum permitted connection lifetime; `None` (or zero) means
    /// connections never expire by age.
    pub max_lifetime: Option<Duration>,
    /// Facade-wide connection defaults.
    pub defaults: ConnectionDefaults,
    /// Pool settings used for every pool this facade creates.
    pub pool: PoolConfig,
    /// Retry bound for the credential-rotation loop.
    pub rotation_retry: RetryPolicy,
}

/// Per-username overrides for the per-user facade.
///
/// Every field mirrors one facade-wide setting; `None` falls back to the
/// facade default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerUserOverrides {
    /// Override for [`PoolConfig::max_total`].
    pub max_total: Option<usize>,
    /// Override for [`PoolConfig::max_idle`].
    pub max_idle: Option<usize>,
    /// Override for [`PoolConfig::min_idle`].
    pub min_idle: Option<usize>,
    /// Override for [`PoolConfig::block_when_exhausted`].
    pub block_when_exhausted: Option<bool>,
    /// Override for [`PoolConfig::max_wait`].
    pub max_wait: Option<Option<Duration>>,
    /// Override for [`PoolConfig::lifo`].
    pub lifo: Option<bool>,
    /// Override for [`PoolConfig::test_on_create`].
    pub test_on_create: Option<bool>,
    /// Override for [`PoolConfig::test_on_borrow`].
    pub test_on_borrow: Option<bool>,
    /// Override for [`PoolConfig::test_on_return`].
    pub test_on_return: Option<bool>,
    /// Override for [`PoolConfig::test_while_idle`].
    pub test_while_idle: Option<bool>,
    /// Override for [`PoolConfig::min_evictable_idle`].
    pub min_evictable_idle: Option<Duration>,
    /// Override for [`PoolConfig::soft_min_evictable_idle`].
    pub soft_min_evictable_idle: Option<Option<Duration>>,
    /// Override for [`PoolConfig::num_tests_per_eviction_run`].
    pub num_tests_per_eviction_run: Option<usize>,
    /// Override for [`PoolConfig::duration_between_eviction_runs`].
    pub duration_between_eviction_runs: Option<Option<Duration>>,
    /// Per-user connection defaults, layered over the facade's.
    pub defaults: ConnectionDefaults,
}

impl PerUserOverrides {
    /// Apply these overrides to a copy of the facade-wide pool config.
    #[must_use]
    pub fn apply_to(&self, base: &PoolConfig) -> PoolConfig {
        let mut config = base.clone();
        if let Some(v) = self.max_total {
            config.max_total = v;
        }
        if let Some(v) = self.max_idle {
            config.max_idle = v;
        }
        if let Some(v) = self.min_idle {
            config.min_idle = v;
        }
        if let Some(v) = self.block_when_exhausted {
            config.block_when_exhausted = v;
        }
        if let Some(v) = self.max_wait {
            config.max_wait = v;
        }
        if let Some(v) = self.lifo {
            config.lifo = v;
        }
        if let Some(v) = self.test_on_create {
            config.test_on_create = v;
        }
        if let Some(v) = self.test_on_borrow {
            config.test_on_borrow = v;
        }
        if let Some(v) = self.test_on_return {
            config.test_on_return = v;
        }
        if let Some(v) = self.test_while_idle {
            config.test_while_idle = v;
        }
        if let Some(v) = self.min_evictable_idle {
            config.min_evictable_idle = v;
        }
        if let Some(v) = self.soft_min_evictable_idle {
            config.soft_min_evictable_idle = v;
        }
        if let Some(v) = self.num_tests_per_eviction_run {
            config.num_tests_per_eviction_run = v;
        }
        if let Some(v) = self.duration_between_eviction_runs {
            config.duration_between_eviction_runs = v;
        }
        config
    }
}
