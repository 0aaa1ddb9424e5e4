//! Acquisition invariants: borrow/return conservation, per-user
//! counters, one pool per key under racing first access, and default
//! application.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use cistern_datasource::testing::InMemorySource;
use cistern_datasource::{
    ConnectionDefaults, DataSourceError, IsolationLevel, PerUserDataSource, PerUserOverrides,
    RawConnection,
};
use cistern_pool::PoolConfig;

fn per_user(source: Arc<InMemorySource>) -> Arc<PerUserDataSource<InMemorySource>> {
    PerUserDataSource::builder()
        .source(source)
        .data_source_name("testdb")
        .build()
        .unwrap()
}

/// Give the event pump a moment to drain.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn borrow_then_return_leaves_pool_size_unchanged() {
    let source = Arc::new(InMemorySource::new().with_account("alice", "pw"));
    let ds = per_user(Arc::clone(&source));

    for _ in 0..5 {
        let lease = ds.get_connection_as("alice", "pw").await.unwrap();
        lease.release();
        settle().await;
        assert_eq!(ds.num_active(Some("alice")), 0);
        assert_eq!(ds.num_idle(Some("alice")), 1);
    }
    // One registration probe + one pooled connection, reused throughout.
    assert_eq!(source.connect_count(), 2);
}

#[tokio::test]
async fn per_user_counters_track_one_borrow() {
    let source = Arc::new(InMemorySource::new().with_account("alice", "pw"));
    let ds = per_user(source);

    assert_eq!(ds.num_active(Some("alice")), 0);

    let lease = ds.get_connection_as("alice", "pw").await.unwrap();
    assert_eq!(ds.num_active(Some("alice")), 1);
    assert_eq!(ds.num_idle(Some("alice")), 0);

    lease.release();
    settle().await;
    assert_eq!(ds.num_active(Some("alice")), 0);
    assert_eq!(ds.num_idle(Some("alice")), 1);
}

#[tokio::test]
async fn racing_first_access_creates_one_pool() {
    let source = Arc::new(InMemorySource::new().with_account("alice", "pw"));
    let ds = per_user(Arc::clone(&source));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ds = Arc::clone(&ds);
        handles.push(tokio::spawn(async move {
            ds.get_connection_as("alice", "pw").await.unwrap()
        }));
    }
    let mut leases = Vec::new();
    for handle in handles {
        leases.push(handle.await.unwrap());
    }

    assert_eq!(ds.num_active(Some("alice")), 8);
    // Eight pooled connections plus exactly one registration probe: a
    // second pool would have cost a second probe.
    assert_eq!(source.connect_count(), 9);
}

#[tokio::test]
async fn users_get_separate_pools() {
    let source = Arc::new(
        InMemorySource::new()
            .with_account("alice", "a")
            .with_account("bob", "b"),
    );
    let ds = per_user(source);

    let alice = ds.get_connection_as("alice", "a").await.unwrap();
    let bob = ds.get_connection_as("bob", "b").await.unwrap();
    assert_eq!(ds.num_active(Some("alice")), 1);
    assert_eq!(ds.num_active(Some("bob")), 1);

    alice.release();
    settle().await;
    assert_eq!(ds.num_idle(Some("alice")), 1);
    assert_eq!(ds.num_active(Some("bob")), 1);
    drop(bob);
}

#[tokio::test]
async fn defaults_are_applied_with_per_user_override() {
    let source = Arc::new(
        InMemorySource::new()
            .with_account("alice", "a")
            .with_account("bob", "b"),
    );
    let ds = PerUserDataSource::builder()
        .source(Arc::clone(&source))
        .defaults(ConnectionDefaults {
            auto_commit: Some(false),
            read_only: None,
            transaction_isolation: Some(IsolationLevel::ReadCommitted),
        })
        .per_user(
            "bob",
            PerUserOverrides {
                defaults: ConnectionDefaults {
                    transaction_isolation: Some(IsolationLevel::Serializable),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .build()
        .unwrap();

    let alice = ds.get_connection_as("alice", "a").await.unwrap();
    assert!(!alice.conn().auto_commit().await.unwrap());
    assert_eq!(alice.conn().isolation(), Some(IsolationLevel::ReadCommitted));
    assert_eq!(alice.conn().warnings_cleared(), 1);

    let bob = ds.get_connection_as("bob", "b").await.unwrap();
    assert_eq!(bob.conn().isolation(), Some(IsolationLevel::Serializable));
}

#[tokio::test]
async fn failing_default_application_surfaces_and_releases() {
    let source = Arc::new(InMemorySource::new().with_account("alice", "pw"));
    let ds = per_user(Arc::clone(&source));

    let lease = ds.get_connection_as("alice", "pw").await.unwrap();
    lease.release();
    settle().await;

    // The pooled connection now refuses attribute changes; clearing
    // warnings fails, the error propagates, and the entry goes back to
    // the pool through the exception path.
    source.connections()[1].fail_settings(true);
    let err = ds.get_connection_as("alice", "pw").await.unwrap_err();
    assert!(matches!(err, DataSourceError::Backend { .. }));
    settle().await;
    assert_eq!(ds.num_active(Some("alice")), 0);
}

#[tokio::test]
async fn exhausted_pool_fails_after_max_wait() {
    let source = Arc::new(InMemorySource::new().with_account("alice", "pw"));
    let ds = PerUserDataSource::builder()
        .source(source)
        .pool_config(PoolConfig {
            max_total: 1,
            max_wait: Some(Duration::from_millis(50)),
            ..Default::default()
        })
        .build()
        .unwrap();

    let _held = ds.get_connection_as("alice", "pw").await.unwrap();
    let err = ds.get_connection_as("alice", "pw").await.unwrap_err();
    assert!(matches!(err, DataSourceError::Acquisition { .. }));
}

#[tokio::test]
async fn settings_are_frozen_after_first_connection() {
    let source = Arc::new(InMemorySource::new().with_account("alice", "pw"));
    let ds = per_user(source);

    ds.set_validation_query(Some("select 1".into())).unwrap();

    let _lease = ds.get_connection_as("alice", "pw").await.unwrap();
    let err = ds.set_validation_query(None).unwrap_err();
    assert!(matches!(err, DataSourceError::Configuration { .. }));
    let err = ds.set_per_user("alice", PerUserOverrides::default()).unwrap_err();
    assert!(matches!(err, DataSourceError::Configuration { .. }));
}

#[tokio::test]
async fn clear_empties_idle_but_keeps_pools_usable() {
    let source = Arc::new(InMemorySource::new().with_account("alice", "pw"));
    let ds = per_user(source);

    ds.get_connection_as("alice", "pw").await.unwrap().release();
    settle().await;
    assert_eq!(ds.num_idle(Some("alice")), 1);

    ds.clear().await;
    assert_eq!(ds.num_idle(Some("alice")), 0);

    // Still serving connections afterwards.
    let lease = ds.get_connection_as("alice", "pw").await.unwrap();
    assert_eq!(ds.num_active(Some("alice")), 1);
    drop(lease);
}
