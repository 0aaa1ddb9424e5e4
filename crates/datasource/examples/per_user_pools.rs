//! Per-user pooling example
//!
//! Demonstrates one pool per username, per-user overrides, and the
//! counters exposed by the facade, against the in-memory test backend.

use std::sync::Arc;
use std::time::Duration;

use cistern_datasource::testing::InMemorySource;
use cistern_datasource::{ConnectionDefaults, PerUserDataSource, PerUserOverrides};
use cistern_pool::PoolConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Per-User Pool Example ===\n");

    let source = Arc::new(
        InMemorySource::new()
            .with_account("app", "app-secret")
            .with_account("admin", "admin-secret"),
    );

    // The admin pool is kept deliberately small; everyone else shares
    // the facade-wide defaults.
    let ds = PerUserDataSource::builder()
        .source(source)
        .data_source_name("example-db")
        .pool_config(PoolConfig {
            max_total: 8,
            max_wait: Some(Duration::from_secs(5)),
            ..Default::default()
        })
        .per_user(
            "admin",
            PerUserOverrides {
                max_total: Some(2),
                defaults: ConnectionDefaults {
                    auto_commit: Some(false),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .build()?;

    let app = ds.get_connection_as("app", "app-secret").await?;
    let admin = ds.get_connection_as("admin", "admin-secret").await?;
    println!(
        "checked out: app={} admin={}",
        ds.num_active(Some("app")),
        ds.num_active(Some("admin"))
    );

    app.release();
    admin.release();
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!(
        "after release: app idle={} admin idle={}",
        ds.num_idle(Some("app")),
        ds.num_idle(Some("admin"))
    );

    ds.close().await?;
    Ok(())
}
