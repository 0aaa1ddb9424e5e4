//! Pool entries and the per-factory tracking structures.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};

use cistern_credential::Credential;
use cistern_pool::Poolable;

use crate::source::{ConnectionId, RawConnection};

/// The pooled unit: a physical connection plus the credential it was
/// created with.
///
/// Entries are cheap to clone (the connection is shared behind an `Arc`);
/// the pool and the entry registry both hold clones of the same entry,
/// related through the connection's identity.
pub struct PoolEntry<C> {
    conn: Arc<C>,
    credential: Credential,
    created_at: Instant,
}

impl<C> Clone for PoolEntry<C> {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            credential: self.credential.clone(),
            created_at: self.created_at,
        }
    }
}

impl<C: RawConnection> PoolEntry<C> {
    /// Wrap a freshly opened connection.
    pub fn new(conn: Arc<C>, credential: Credential) -> Self {
        Self {
            conn,
            credential,
            created_at: Instant::now(),
        }
    }

    /// The physical connection.
    #[must_use]
    pub fn conn(&self) -> &Arc<C> {
        &self.conn
    }

    /// The credential this entry was created with.
    #[must_use]
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// When the connection was opened.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// How long this entry has existed.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl<C: RawConnection> Poolable for PoolEntry<C> {
    fn identity(&self) -> u64 {
        self.conn.id().as_u64()
    }
}

impl<C: RawConnection> fmt::Debug for PoolEntry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("conn", &self.conn.id())
            .field("credential", &self.credential)
            .finish()
    }
}

/// Concurrent map from connection identity to its pool entry.
///
/// Written by the factory on make/destroy, read by the event pump on the
/// listener side — possibly from a task unrelated to any borrower.
pub struct PoolEntryRegistry<C> {
    entries: DashMap<ConnectionId, PoolEntry<C>>,
}

impl<C> Default for PoolEntryRegistry<C> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<C: RawConnection> PoolEntryRegistry<C> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry under its connection's identity.
    pub fn insert(&self, entry: PoolEntry<C>) {
        self.entries.insert(entry.conn().id(), entry);
    }

    /// Look up the entry for a connection.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<PoolEntry<C>> {
        self.entries.get(&id).map(|e| e.value().clone())
    }

    /// Remove and return the entry for a connection.
    pub fn remove(&self, id: ConnectionId) -> Option<PoolEntry<C>> {
        self.entries.remove(&id).map(|(_, entry)| entry)
    }

    /// Number of tracked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Connections currently owned by the validator.
///
/// A close event fired by the validation probe itself must not trigger a
/// pool return; membership here is what suppresses it.
#[derive(Default)]
pub struct ValidatingSet {
    set: DashSet<ConnectionId>,
}

impl ValidatingSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a connection as under validation.
    pub fn insert(&self, id: ConnectionId) {
        self.set.insert(id);
    }

    /// Clear the validation mark.
    pub fn remove(&self, id: ConnectionId) {
        self.set.remove(&id);
    }

    /// Whether a connection is under validation.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.set.contains(&id)
    }
}

impl fmt::Debug for ValidatingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatingSet")
            .field("len", &self.set.len())
            .finish()
    }
}
