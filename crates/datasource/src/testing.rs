//! In-memory connection source for tests and examples.
//!
//! [`InMemorySource`] keeps an account table (username → password),
//! rejects mismatched credentials the way a real backend would, and
//! produces [`InMemoryConnection`]s whose behavior (validity, query
//! results, close failures) is injectable per connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use cistern_credential::Credential;

use crate::error::{DataSourceError, DataSourceResult};
use crate::source::{
    ConnectionEvent, ConnectionId, ConnectionSource, EventSlot, IsolationLevel, RawConnection,
};

/// In-memory stand-in for a database backend.
pub struct InMemorySource {
    accounts: RwLock<HashMap<String, String>>,
    next_id: AtomicU64,
    connect_count: AtomicU64,
    refuse_all: AtomicBool,
    live: Mutex<Vec<Arc<InMemoryConnection>>>,
}

impl InMemorySource {
    /// Create a source with no accounts. Anonymous connects succeed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            connect_count: AtomicU64::new(0),
            refuse_all: AtomicBool::new(false),
            live: Mutex::new(Vec::new()),
        }
    }

    /// Add an account (builder-style).
    #[must_use]
    pub fn with_account(self, username: &str, password: &str) -> Self {
        self.accounts
            .write()
            .insert(username.to_string(), password.to_string());
        self
    }

    /// Change an account's password, simulating an upstream rotation.
    pub fn set_password(&self, username: &str, password: &str) {
        self.accounts
            .write()
            .insert(username.to_string(), password.to_string());
    }

    /// Refuse every subsequent connect attempt.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Total connect attempts that produced a connection.
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Every connection this source has produced, in creation order.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<InMemoryConnection>> {
        self.live.lock().clone()
    }

    fn authenticate(&self, credential: &Credential) -> DataSourceResult<()> {
        let Some(username) = credential.username() else {
            return Ok(());
        };
        let accounts = self.accounts.read();
        let Some(expected) = accounts.get(username) else {
            return Err(DataSourceError::backend(format!(
                "unknown user '{username}'"
            )));
        };
        if credential.matches_password(Some(expected)) {
            Ok(())
        } else {
            Err(DataSourceError::backend(format!(
                "authentication failed for user '{username}'"
            )))
        }
    }
}

impl Default for InMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionSource for InMemorySource {
    type Conn = InMemoryConnection;

    async fn connect(&self, credential: &Credential) -> DataSourceResult<Arc<InMemoryConnection>> {
        if self.refuse_all.load(Ordering::SeqCst) {
            return Err(DataSourceError::backend("backend refused connection"));
        }
        self.authenticate(credential)?;
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        let conn = Arc::new(InMemoryConnection::new(id));
        self.live.lock().push(Arc::clone(&conn));
        Ok(conn)
    }
}

/// A fake physical connection with injectable behavior.
pub struct InMemoryConnection {
    id: ConnectionId,
    events: EventSlot,
    closed: AtomicBool,
    valid: AtomicBool,
    fail_close: AtomicBool,
    query_rows: AtomicU64,
    fail_queries: AtomicBool,
    fail_settings: AtomicBool,
    auto_commit: AtomicBool,
    read_only: AtomicBool,
    isolation: Mutex<Option<IsolationLevel>>,
    rollbacks: AtomicU64,
    warnings_cleared: AtomicU64,
}

impl InMemoryConnection {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            events: EventSlot::new(),
            closed: AtomicBool::new(false),
            valid: AtomicBool::new(true),
            fail_close: AtomicBool::new(false),
            query_rows: AtomicU64::new(1),
            fail_queries: AtomicBool::new(false),
            fail_settings: AtomicBool::new(false),
            auto_commit: AtomicBool::new(true),
            read_only: AtomicBool::new(false),
            isolation: Mutex::new(None),
            rollbacks: AtomicU64::new(0),
            warnings_cleared: AtomicU64::new(0),
        }
    }

    /// Whether the physical connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make the native validity check report `valid`.
    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }

    /// Make `close` fail (for secondary-cleanup paths).
    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Rows the next validation queries will report.
    pub fn set_query_rows(&self, rows: u64) {
        self.query_rows.store(rows, Ordering::SeqCst);
    }

    /// Make every query raise instead of returning rows.
    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Make attribute changes (and warning clears) raise.
    pub fn fail_settings(&self, fail: bool) {
        self.fail_settings.store(fail, Ordering::SeqCst);
    }

    /// Number of rollbacks issued on this connection.
    #[must_use]
    pub fn rollback_count(&self) -> u64 {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Number of times warnings were cleared.
    #[must_use]
    pub fn warnings_cleared(&self) -> u64 {
        self.warnings_cleared.load(Ordering::SeqCst)
    }

    /// The isolation level a default application installed, if any.
    #[must_use]
    pub fn isolation(&self) -> Option<IsolationLevel> {
        *self.isolation.lock()
    }

    /// Report a fatal backend error to the attached listener.
    pub fn fire_error(&self, message: &str) {
        self.events.emit(
            self.id,
            ConnectionEvent::Error {
                message: message.to_string(),
            },
        );
    }

    fn ensure_open(&self) -> DataSourceResult<()> {
        if self.is_closed() {
            return Err(DataSourceError::backend("connection is closed"));
        }
        Ok(())
    }

    fn ensure_settings_work(&self) -> DataSourceResult<()> {
        self.ensure_open()?;
        if self.fail_settings.load(Ordering::SeqCst) {
            return Err(DataSourceError::backend("attribute change failed"));
        }
        Ok(())
    }
}

#[async_trait]
impl RawConnection for InMemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn events(&self) -> &EventSlot {
        &self.events
    }

    async fn is_valid(&self, _timeout: Option<Duration>) -> DataSourceResult<bool> {
        Ok(!self.is_closed() && self.valid.load(Ordering::SeqCst))
    }

    async fn execute_query(
        &self,
        _query: &str,
        _timeout: Option<Duration>,
    ) -> DataSourceResult<u64> {
        self.ensure_open()?;
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(DataSourceError::backend("query failed"));
        }
        Ok(self.query_rows.load(Ordering::SeqCst))
    }

    async fn rollback(&self) -> DataSourceResult<()> {
        self.ensure_open()?;
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn auto_commit(&self) -> DataSourceResult<bool> {
        self.ensure_open()?;
        Ok(self.auto_commit.load(Ordering::SeqCst))
    }

    async fn set_auto_commit(&self, value: bool) -> DataSourceResult<()> {
        self.ensure_settings_work()?;
        self.auto_commit.store(value, Ordering::SeqCst);
        Ok(())
    }

    async fn read_only(&self) -> DataSourceResult<bool> {
        self.ensure_open()?;
        Ok(self.read_only.load(Ordering::SeqCst))
    }

    async fn set_read_only(&self, value: bool) -> DataSourceResult<()> {
        self.ensure_settings_work()?;
        self.read_only.store(value, Ordering::SeqCst);
        Ok(())
    }

    async fn set_transaction_isolation(&self, level: IsolationLevel) -> DataSourceResult<()> {
        self.ensure_settings_work()?;
        *self.isolation.lock() = Some(level);
        Ok(())
    }

    async fn clear_warnings(&self) -> DataSourceResult<()> {
        self.ensure_settings_work()?;
        self.warnings_cleared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> DataSourceResult<()> {
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(DataSourceError::backend("close failed"));
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn anonymous_connect_succeeds() {
        let source = InMemorySource::new();
        let conn = source.connect(&Credential::anonymous()).await.unwrap();
        assert!(conn.is_valid(None).await.unwrap());
    }

    #[tokio::test]
    async fn wrong_password_is_refused() {
        let source = InMemorySource::new().with_account("alice", "secret");
        assert!(
            source
                .connect(&Credential::new("alice", "secret"))
                .await
                .is_ok()
        );
        assert!(
            source
                .connect(&Credential::new("alice", "wrong"))
                .await
                .is_err()
        );
        assert!(
            source
                .connect(&Credential::new("mallory", "secret"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn password_rotation_switches_accepted_credential() {
        let source = InMemorySource::new().with_account("alice", "old");
        source.set_password("alice", "new");
        assert!(
            source
                .connect(&Credential::new("alice", "old"))
                .await
                .is_err()
        );
        assert!(
            source
                .connect(&Credential::new("alice", "new"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn closed_connection_is_invalid() {
        let source = InMemorySource::new();
        let conn = source.connect(&Credential::anonymous()).await.unwrap();
        conn.close().await.unwrap();
        assert!(!conn.is_valid(None).await.unwrap());
        assert!(conn.execute_query("select 1", None).await.is_err());
    }
}
