//! Pool configuration surface.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

/// Configuration for an [`ObjectPool`](crate::ObjectPool) (applied per key
/// in a [`KeyedObjectPool`](crate::KeyedObjectPool)).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of objects alive at once (checked out + idle).
    pub max_total: usize,
    /// Maximum number of idle objects kept; returns beyond this are
    /// destroyed instead of pooled.
    pub max_idle: usize,
    /// Minimum number of idle objects the evictor tries to maintain.
    pub min_idle: usize,
    /// Whether a borrow against an exhausted pool waits for capacity.
    /// When false, exhaustion fails immediately.
    pub block_when_exhausted: bool,
    /// Upper bound on how long a blocking borrow waits. `None` waits
    /// without bound.
    pub max_wait: Option<Duration>,
    /// Dispensing order: `true` hands out the most recently returned
    /// object (stack), `false` the least recently returned (queue).
    pub lifo: bool,
    /// Validate a freshly made object before first hand-out.
    pub test_on_create: bool,
    /// Validate an idle object before handing it to a borrower.
    pub test_on_borrow: bool,
    /// Validate an object when it is returned.
    pub test_on_return: bool,
    /// Revalidate idle objects during eviction runs.
    pub test_while_idle: bool,
    /// Idle duration after which an object is always eligible for
    /// eviction.
    pub min_evictable_idle: Duration,
    /// Idle duration after which an object is eligible for eviction
    /// provided `min_idle` objects would remain. `None` disables the
    /// soft rule.
    pub soft_min_evictable_idle: Option<Duration>,
    /// How many idle objects each eviction run examines.
    pub num_tests_per_eviction_run: usize,
    /// Interval of the background eviction task. `None` disables
    /// background eviction ([`ObjectPool::evict`](crate::ObjectPool::evict)
    /// can still be driven manually).
    pub duration_between_eviction_runs: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 8,
            max_idle: 8,
            min_idle: 0,
            block_when_exhausted: true,
            max_wait: Some(Duration::from_secs(30)),
            lifo: true,
            test_on_create: false,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            min_evictable_idle: Duration::from_secs(30 * 60),
            soft_min_evictable_idle: None,
            num_tests_per_eviction_run: 3,
            duration_between_eviction_runs: None,
        }
    }
}

impl PoolConfig {
    /// Validate pool configuration, returning an error if invalid.
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_total == 0 {
            return Err(PoolError::configuration("max_total must be greater than 0"));
        }
        if self.min_idle > self.max_idle {
            return Err(PoolError::configuration(format!(
                "min_idle ({}) must not exceed max_idle ({})",
                self.min_idle, self.max_idle
            )));
        }
        if let Some(interval) = self.duration_between_eviction_runs
            && interval.is_zero()
        {
            return Err(PoolError::configuration(
                "duration_between_eviction_runs must be greater than zero",
            ));
        }
        Ok(())
    }
}
