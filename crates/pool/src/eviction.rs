//! Pluggable idle-eviction policy.
//!
//! The pool's background evictor samples idle objects and asks the
//! installed policy whether each one should go. The scheduling loop is
//! the pool's concern; only the decision is pluggable.

use std::time::Duration;

/// The slice of pool state a policy decision may depend on.
#[derive(Debug, Clone, Copy)]
pub struct EvictionConfig {
    /// Idle duration after which eviction is unconditional.
    pub idle_evict_duration: Duration,
    /// Idle duration after which eviction applies while more than
    /// `min_idle` objects remain. `None` disables the soft rule.
    pub idle_soft_evict_duration: Option<Duration>,
    /// Floor the soft rule must not evict below.
    pub min_idle: usize,
}

/// Decides whether an idle object should be evicted.
pub trait EvictionPolicy: Send + Sync + 'static {
    /// `idle_duration` is how long the object has sat idle;
    /// `idle_count` is the current number of idle objects including
    /// this one.
    fn evict(&self, config: &EvictionConfig, idle_duration: Duration, idle_count: usize) -> bool;
}

/// Default policy: hard idle-timeout rule plus the soft rule guarded by
/// `min_idle`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEvictionPolicy;

impl EvictionPolicy for DefaultEvictionPolicy {
    fn evict(&self, config: &EvictionConfig, idle_duration: Duration, idle_count: usize) -> bool {
        if idle_duration > config.idle_evict_duration {
            return true;
        }
        match config.idle_soft_evict_duration {
            Some(soft) => idle_duration > soft && idle_count > config.min_idle,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(evict_secs: u64, soft_secs: Option<u64>, min_idle: usize) -> EvictionConfig {
        EvictionConfig {
            idle_evict_duration: Duration::from_secs(evict_secs),
            idle_soft_evict_duration: soft_secs.map(Duration::from_secs),
            min_idle,
        }
    }

    #[test]
    fn evicts_past_hard_timeout() {
        let policy = DefaultEvictionPolicy;
        let cfg = config(60, None, 0);
        assert!(policy.evict(&cfg, Duration::from_secs(61), 1));
        assert!(!policy.evict(&cfg, Duration::from_secs(59), 1));
    }

    #[test]
    fn soft_rule_respects_min_idle() {
        let policy = DefaultEvictionPolicy;
        let cfg = config(600, Some(30), 2);
        // Past soft timeout but only min_idle objects remain — keep.
        assert!(!policy.evict(&cfg, Duration::from_secs(31), 2));
        // Past soft timeout with surplus idle objects — evict.
        assert!(policy.evict(&cfg, Duration::from_secs(31), 3));
    }

    #[test]
    fn soft_rule_disabled_when_unset() {
        let policy = DefaultEvictionPolicy;
        let cfg = config(600, None, 0);
        assert!(!policy.evict(&cfg, Duration::from_secs(599), 10));
    }
}
