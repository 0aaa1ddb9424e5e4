//! # Cistern object pool
//!
//! Generic object-pool engine: bounded borrow/return/invalidate with
//! factory lifecycle callbacks, LIFO/FIFO dispensing, test-on-* hooks,
//! and a pluggable idle-eviction policy. [`ObjectPool`] pools a single
//! homogeneous set of objects; [`KeyedObjectPool`] maintains one sub-pool
//! per key.
//!
//! The pool never decides *what* makes an object valid — that is the
//! factory's job via [`PooledFactory::validate_object`]; the pool only
//! applies the configured policy (discard and retry, or hand out).

pub mod config;
pub mod error;
pub mod eviction;
pub mod keyed;
pub mod object;
pub mod pool;

pub use config::PoolConfig;
pub use error::{PoolError, PoolResult};
pub use eviction::{DefaultEvictionPolicy, EvictionConfig, EvictionPolicy};
pub use keyed::{KeyedObjectPool, KeyedPooledFactory};
pub use object::{PoolStats, Poolable};
pub use pool::{ObjectPool, PooledFactory, WeakObjectPool};
