//! # Cistern data sources
//!
//! Credential-aware pooling layer between logical clients and a raw
//! connection source. Guarantees at most one live pool per identity key,
//! reclaims connections on logical close through an explicit event
//! channel, validates before reuse, expires by lifetime, and absorbs
//! in-flight password changes without disturbing other users' pools.
//!
//! Two facade variants: [`PerUserDataSource`] (a dedicated pool per
//! username, per-user tunables) and [`SharedDataSource`] (one pool keyed
//! by credential, username-only key identity).

pub mod config;
pub mod core;
pub mod entry;
pub mod error;
pub mod factory;
pub mod per_user;
pub mod registry;
pub mod rotation;
pub mod shared;
pub mod source;
pub mod testing;
pub mod validator;

pub use config::{ConnectionDefaults, FacadeConfig, PerUserOverrides};
pub use core::LeasedConnection;
pub use error::{DataSourceError, DataSourceResult};
pub use factory::{ManagedKeyedPool, ManagedPool, PoolManager};
pub use per_user::{PerUserDataSource, PerUserDataSourceBuilder, PoolKey};
pub use registry::{InstanceRegistry, PooledDataSource};
pub use rotation::RetryPolicy;
pub use shared::{SharedDataSource, SharedDataSourceBuilder};
pub use source::{
    ConnectionEvent, ConnectionId, ConnectionSource, EventSlot, IsolationLevel, RawConnection,
};
pub use validator::ConnectionValidator;
