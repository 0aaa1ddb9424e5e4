//! Connection-source contract and per-connection event plumbing.
//!
//! A [`ConnectionSource`] produces [`RawConnection`]s on demand. Each
//! connection carries an [`EventSlot`] through which exactly one listener
//! (the owning factory) receives [`ConnectionEvent`]s: the logical close
//! that triggers reclaim, and the fatal error that triggers invalidation.
//! Delivery is an explicit channel, so ordering and duplicate handling are
//! a testable contract rather than a side effect of listener registration.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use cistern_credential::Credential;

use crate::error::DataSourceResult;

/// Identity of a physical connection for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle events a connection can report to its listener.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Logical close: the current holder is done with the connection.
    Closed,
    /// A fatal backend error; the connection must not be reused.
    Error {
        /// Description of the failure.
        message: String,
    },
}

/// Sending half of a factory's event channel.
pub type EventSender = mpsc::UnboundedSender<(ConnectionId, ConnectionEvent)>;
/// Receiving half of a factory's event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<(ConnectionId, ConnectionEvent)>;

/// Create the event channel a factory drains.
#[must_use]
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Per-connection listener slot.
///
/// Holds at most one attached [`EventSender`]. After [`detach`], emitted
/// events are dropped — detaching is how a factory stops any further
/// reclaim attempts for a connection (e.g. after a fatal error).
///
/// [`detach`]: EventSlot::detach
#[derive(Default)]
pub struct EventSlot {
    listener: Mutex<Option<EventSender>>,
}

impl EventSlot {
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a listener, replacing any previous one.
    pub fn attach(&self, sender: EventSender) {
        *self.listener.lock() = Some(sender);
    }

    /// Remove the listener; subsequent events are not delivered.
    pub fn detach(&self) {
        *self.listener.lock() = None;
    }

    /// Whether a listener is currently attached.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Deliver an event to the attached listener, if any.
    ///
    /// Fire-and-forget: with no listener attached (or its receiver gone)
    /// the event is dropped.
    pub fn emit(&self, id: ConnectionId, event: ConnectionEvent) {
        let listener = self.listener.lock().clone();
        if let Some(sender) = listener {
            // Ignore the error — it just means the receiver is gone.
            let _ = sender.send((id, event));
        }
    }
}

impl fmt::Debug for EventSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSlot")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Transaction isolation levels a connection default can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Dirty reads allowed.
    ReadUncommitted,
    /// Only committed data is visible.
    ReadCommitted,
    /// Repeated reads within a transaction see the same rows.
    RepeatableRead,
    /// Full serializable isolation.
    Serializable,
}

/// A live handle to a physical backend connection.
///
/// Exclusively owned by its pool entry until closed or destroyed. The
/// query surface here is the minimum the pooling layer itself needs:
/// validation probes and connection-default application.
#[async_trait]
pub trait RawConnection: Send + Sync + 'static {
    /// Stable identity of this connection.
    fn id(&self) -> ConnectionId;

    /// The listener slot lifecycle events are delivered through.
    fn events(&self) -> &EventSlot;

    /// Native validity check, bounded by `timeout` when given.
    /// `None` leaves the bound to the backend.
    async fn is_valid(&self, timeout: Option<Duration>) -> DataSourceResult<bool>;

    /// Execute a validation query, returning the number of rows produced.
    async fn execute_query(&self, query: &str, timeout: Option<Duration>)
    -> DataSourceResult<u64>;

    /// Roll back the current transaction.
    async fn rollback(&self) -> DataSourceResult<()>;

    /// Current auto-commit mode.
    async fn auto_commit(&self) -> DataSourceResult<bool>;

    /// Change the auto-commit mode.
    async fn set_auto_commit(&self, value: bool) -> DataSourceResult<()>;

    /// Current read-only mode.
    async fn read_only(&self) -> DataSourceResult<bool>;

    /// Change the read-only mode.
    async fn set_read_only(&self, value: bool) -> DataSourceResult<()>;

    /// Change the transaction isolation level.
    async fn set_transaction_isolation(&self, level: IsolationLevel) -> DataSourceResult<()>;

    /// Discard any pending warnings.
    async fn clear_warnings(&self) -> DataSourceResult<()>;

    /// Close the physical connection.
    async fn close(&self) -> DataSourceResult<()>;
}

/// Produces physical connections for optional credentials.
///
/// Implementations must either produce a connection or fail — the
/// signature leaves no room for the "silently absent connection" a looser
/// contract would have to treat as a fatal internal error.
#[async_trait]
pub trait ConnectionSource: Send + Sync + 'static {
    /// The connection type this source produces.
    type Conn: RawConnection;

    /// Open a new physical connection authenticated as `credential`
    /// (the anonymous credential requests the source's default identity).
    async fn connect(&self, credential: &Credential) -> DataSourceResult<std::sync::Arc<Self::Conn>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_listener_is_dropped() {
        let slot = EventSlot::new();
        // Must not panic or block.
        slot.emit(ConnectionId::new(1), ConnectionEvent::Closed);
    }

    #[tokio::test]
    async fn emit_reaches_attached_listener() {
        let (tx, mut rx) = event_channel();
        let slot = EventSlot::new();
        slot.attach(tx);
        slot.emit(ConnectionId::new(7), ConnectionEvent::Closed);

        let (id, event) = rx.recv().await.unwrap();
        assert_eq!(id, ConnectionId::new(7));
        assert!(matches!(event, ConnectionEvent::Closed));
    }

    #[tokio::test]
    async fn detach_stops_delivery() {
        let (tx, mut rx) = event_channel();
        let slot = EventSlot::new();
        slot.attach(tx);
        slot.detach();
        slot.emit(ConnectionId::new(7), ConnectionEvent::Closed);

        assert!(rx.try_recv().is_err(), "detached slot must not deliver");
    }

    #[test]
    fn connection_id_display() {
        assert_eq!(ConnectionId::new(42).to_string(), "conn-42");
    }
}
