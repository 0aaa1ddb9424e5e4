//! The acquisition driver shared by both data-source facades.
//!
//! Implements the connection-acquisition state machine: borrow, password
//! check, credential-rotation with a bounded retry, default application.
//! Facades plug in their pool topology through [`PoolAccess`]; everything
//! else lives here exactly once.

use std::fmt;
use std::sync::Arc;

use cistern_credential::{Credential, SecretString};

use crate::config::ConnectionDefaults;
use crate::entry::PoolEntry;
use crate::error::{DataSourceError, DataSourceResult};
use crate::factory::PoolManager;
use crate::rotation::RetryPolicy;
use crate::source::{ConnectionEvent, ConnectionSource, RawConnection};

/// The topology-specific slice of a facade: resolve-or-create the pool
/// for a user and borrow from it, and expose that pool's manager.
pub(crate) trait PoolAccess<S: ConnectionSource>: Send + Sync {
    /// Borrow an entry for the user, lazily creating the pool.
    async fn borrow(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> DataSourceResult<PoolEntry<S::Conn>>;

    /// The manager of the user's pool. Only called after a successful
    /// borrow for the same user.
    async fn manager(&self, username: Option<&str>) -> DataSourceResult<Arc<dyn PoolManager>>;

    /// Effective connection defaults for the user.
    fn defaults(&self, username: Option<&str>) -> ConnectionDefaults;

    /// The raw connection source (used for rotation probes).
    fn source(&self) -> &Arc<S>;

    /// Retry bound for the rotation loop.
    fn retry_policy(&self) -> RetryPolicy;
}

/// Build the credential a caller's username/password pair describes.
pub(crate) fn credential_from(username: Option<&str>, password: Option<&str>) -> Credential {
    match (username, password) {
        (Some(user), Some(pass)) => Credential::new(user, pass),
        (Some(user), None) => Credential::username_only(user),
        (None, _) => Credential::anonymous(),
    }
}

/// Run the full acquisition protocol for one `get_connection` call.
pub(crate) async fn acquire<S, A>(
    access: &A,
    username: Option<&str>,
    password: Option<&str>,
) -> DataSourceResult<LeasedConnection<S::Conn>>
where
    S: ConnectionSource,
    A: PoolAccess<S>,
{
    let mut entry = access.borrow(username, password).await?;

    if !entry.credential().matches_password(password) {
        entry = rotate(access, entry, username, password).await?;
    }

    let defaults = access.defaults(username);
    if let Err(e) = apply_defaults(entry.conn().as_ref(), defaults).await {
        close_due_to_exception(&entry);
        return Err(e);
    }
    Ok(LeasedConnection::new(entry))
}

/// The borrowed entry's password does not match the caller's. Find out
/// which side is stale and converge the pool on the new password.
async fn rotate<S, A>(
    access: &A,
    entry: PoolEntry<S::Conn>,
    username: Option<&str>,
    password: Option<&str>,
) -> DataSourceResult<PoolEntry<S::Conn>>
where
    S: ConnectionSource,
    A: PoolAccess<S>,
{
    // Probe the source directly with the caller's credentials. If the
    // backend rejects them the password did not change: the caller is
    // simply wrong.
    match access.source().connect(&credential_from(username, password)).await {
        Ok(probe) => {
            // The probe is side-effect-free; discard it. The connect
            // itself was the signal, a close failure changes nothing.
            let _ = probe.close().await;
        }
        Err(rejection) => {
            close_due_to_exception(&entry);
            return Err(DataSourceError::credential_mismatch(rejection));
        }
    }

    tracing::info!(
        user = username.unwrap_or("<anonymous>"),
        "password changed upstream; rotating pool credential"
    );

    // The backend accepted the new password: the pool's cached one is
    // stale. Drop the borrowed entry and redirect future creations.
    let manager = access.manager(username).await?;
    manager.invalidate(entry.conn().id()).await?;
    manager.set_password(password.map(SecretString::new));

    // Drain stale entries until one with the new password comes out.
    // Bounded: a backend that keeps answering with yet another password
    // must not spin us forever.
    for _ in access.retry_policy().attempts() {
        let candidate = access.borrow(username, password).await?;
        if candidate.credential().matches_password(password) {
            return Ok(candidate);
        }
        manager.invalidate(candidate.conn().id()).await?;
    }
    Err(DataSourceError::acquisition(
        "password change failure: retry attempts exhausted",
    ))
}

/// Apply connection defaults, preferring values already in effect.
async fn apply_defaults<C: RawConnection>(
    conn: &C,
    defaults: ConnectionDefaults,
) -> DataSourceResult<()> {
    if let Some(auto_commit) = defaults.auto_commit
        && conn.auto_commit().await? != auto_commit
    {
        conn.set_auto_commit(auto_commit).await?;
    }
    if let Some(level) = defaults.transaction_isolation {
        conn.set_transaction_isolation(level).await?;
    }
    if let Some(read_only) = defaults.read_only
        && conn.read_only().await? != read_only
    {
        conn.set_read_only(read_only).await?;
    }
    conn.clear_warnings().await
}

/// Release an entry through the normal event path while handling another
/// error. Anything that goes wrong past this point is the event pump's
/// to log; the primary error must win.
fn close_due_to_exception<C: RawConnection>(entry: &PoolEntry<C>) {
    let conn = entry.conn();
    conn.events().emit(conn.id(), ConnectionEvent::Closed);
}

// ---------------------------------------------------------------------------
// LeasedConnection
// ---------------------------------------------------------------------------

/// A connection on loan to a caller.
///
/// Dereferences to the raw connection. Dropping (or calling
/// [`release`](Self::release)) emits the logical-close event, which is
/// what hands the underlying entry back to its pool.
pub struct LeasedConnection<C: RawConnection> {
    entry: Option<PoolEntry<C>>,
}

impl<C: RawConnection> LeasedConnection<C> {
    pub(crate) fn new(entry: PoolEntry<C>) -> Self {
        Self { entry: Some(entry) }
    }

    /// The raw connection.
    #[must_use]
    pub fn conn(&self) -> &Arc<C> {
        self.entry
            .as_ref()
            .expect("lease used after release")
            .conn()
    }

    /// The username this connection was authenticated as.
    #[must_use]
    pub fn username(&self) -> Option<String> {
        self.entry
            .as_ref()
            .and_then(|e| e.credential().username().map(str::to_owned))
    }

    /// Explicitly hand the connection back to its pool.
    pub fn release(mut self) {
        self.emit_closed();
    }

    fn emit_closed(&mut self) {
        if let Some(entry) = self.entry.take() {
            let conn = entry.conn();
            conn.events().emit(conn.id(), ConnectionEvent::Closed);
        }
    }
}

impl<C: RawConnection> std::ops::Deref for LeasedConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn()
    }
}

impl<C: RawConnection> Drop for LeasedConnection<C> {
    fn drop(&mut self) {
        self.emit_closed();
    }
}

impl<C: RawConnection> std::fmt::Debug for LeasedConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeasedConnection")
            .field("entry", &self.entry.as_ref().map(|e| e.conn().id()))
            .finish()
    }
}
