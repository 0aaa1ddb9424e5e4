//! Credential-rotation behavior against a backend whose passwords change
//! underneath live pools.

use std::sync::Arc;
use std::time::Duration;

use cistern_datasource::testing::InMemorySource;
use cistern_datasource::{DataSourceError, PerUserDataSource, SharedDataSource};

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn per_user_rotation_replaces_the_pool_exactly_once() {
    let source = Arc::new(InMemorySource::new().with_account("alice", "p1"));
    let ds = PerUserDataSource::builder()
        .source(Arc::clone(&source))
        .build()
        .unwrap();

    // Seed the pool under the old password.
    ds.get_connection_as("alice", "p1").await.unwrap().release();
    settle().await;
    assert_eq!(ds.num_idle(Some("alice")), 1);
    let old_conn = source.connections()[1].clone();

    // The password changes upstream.
    source.set_password("alice", "p2");

    // Borrowing with the new password rotates: the stale entry is
    // destroyed and a fresh pool serves the new credential.
    let lease = ds.get_connection_as("alice", "p2").await.unwrap();
    assert_eq!(ds.num_active(Some("alice")), 1);
    assert!(old_conn.is_closed(), "stale entry must be destroyed");
    lease.release();
    settle().await;

    // Subsequent borrows under the new password reuse the rotated pool
    // with no further backend traffic.
    let connects_after_rotation = source.connect_count();
    ds.get_connection_as("alice", "p2").await.unwrap().release();
    settle().await;
    assert_eq!(source.connect_count(), connects_after_rotation);
}

#[tokio::test]
async fn wrong_password_is_refused_without_disturbing_other_pools() {
    let source = Arc::new(
        InMemorySource::new()
            .with_account("alice", "right")
            .with_account("bob", "pw"),
    );
    let ds = PerUserDataSource::builder()
        .source(Arc::clone(&source))
        .build()
        .unwrap();

    // Seed both users' pools.
    ds.get_connection_as("alice", "right").await.unwrap().release();
    ds.get_connection_as("bob", "pw").await.unwrap().release();
    settle().await;

    let err = ds.get_connection_as("alice", "wrong").await.unwrap_err();
    assert!(matches!(err, DataSourceError::CredentialMismatch { .. }));
    settle().await;

    // The mistakenly borrowed entry went back to alice's pool, and bob
    // never noticed anything.
    assert_eq!(ds.num_active(Some("alice")), 0);
    assert_eq!(ds.num_idle(Some("alice")), 1);
    assert_eq!(ds.num_idle(Some("bob")), 1);

    // The old password still works.
    ds.get_connection_as("alice", "right").await.unwrap().release();
}

#[tokio::test]
async fn per_user_new_password_on_empty_pool_reregisters() {
    let source = Arc::new(InMemorySource::new().with_account("alice", "p1"));
    let ds = PerUserDataSource::builder()
        .source(Arc::clone(&source))
        .build()
        .unwrap();

    // Register alice's pool and keep its only connection checked out, so
    // the next borrow has to create — under the stale cached password.
    let _held = ds.get_connection_as("alice", "p1").await.unwrap();
    source.set_password("alice", "p2");

    // The next creation under the old credential fails, the facade
    // probes the caller's password, and rebuilds the pool under it.
    let lease = ds.get_connection_as("alice", "p2").await.unwrap();
    assert_eq!(lease.username().as_deref(), Some("alice"));
}

#[tokio::test]
async fn shared_rotation_converges_on_the_new_password() {
    let source = Arc::new(InMemorySource::new().with_account("alice", "p1"));
    let ds = SharedDataSource::builder()
        .source(Arc::clone(&source))
        .build()
        .unwrap();

    ds.get_connection_as("alice", "p1").await.unwrap().release();
    settle().await;
    assert_eq!(ds.num_idle(Some("alice")), 1);
    let old_conn = source.connections()[0].clone();

    source.set_password("alice", "p2");

    let lease = ds.get_connection_as("alice", "p2").await.unwrap();
    assert!(old_conn.is_closed(), "stale entry must be destroyed");
    assert_eq!(ds.num_active(Some("alice")), 1);
    lease.release();
    settle().await;

    // Converged: the pool now serves p2 without rotation traffic.
    let connects = source.connect_count();
    ds.get_connection_as("alice", "p2").await.unwrap().release();
    settle().await;
    assert_eq!(source.connect_count(), connects);
}

#[tokio::test]
async fn shared_wrong_password_fails_with_mismatch() {
    let source = Arc::new(InMemorySource::new().with_account("alice", "right"));
    let ds = SharedDataSource::builder()
        .source(Arc::clone(&source))
        .build()
        .unwrap();

    ds.get_connection_as("alice", "right").await.unwrap().release();
    settle().await;

    let err = ds.get_connection_as("alice", "wrong").await.unwrap_err();
    assert!(matches!(err, DataSourceError::CredentialMismatch { .. }));
    settle().await;
    assert_eq!(ds.num_idle(Some("alice")), 1);
}
