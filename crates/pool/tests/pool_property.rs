//! Property tests for borrow/return invariants.
//!
//! After any sequence of borrow and return operations,
//! `active + idle <= max_total` must hold, and once everything is
//! returned the pool conserves its size (`active == 0`,
//! `created - destroyed == idle`).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;

use cistern_pool::{ObjectPool, PoolConfig, PoolResult, Poolable, PooledFactory};

#[derive(Clone)]
struct Counter {
    id: u64,
}

impl Poolable for Counter {
    fn identity(&self) -> u64 {
        self.id
    }
}

struct CountingFactory {
    next: AtomicU64,
}

impl CountingFactory {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl PooledFactory for CountingFactory {
    type Object = Counter;

    async fn make_object(&self) -> PoolResult<Counter> {
        Ok(Counter {
            id: self.next.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn destroy_object(&self, _obj: Counter) -> PoolResult<()> {
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(30))]

    #[test]
    fn active_plus_idle_never_exceeds_max_total(
        max_total in 1usize..8,
        ops in proptest::collection::vec(prop_oneof![Just(true), Just(false)], 1..40),
        lifo in proptest::bool::ANY,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let config = PoolConfig {
                max_total,
                max_idle: max_total,
                block_when_exhausted: false,
                lifo,
                ..Default::default()
            };
            let pool = ObjectPool::new(Arc::new(CountingFactory::new()), config).unwrap();
            let mut held = Vec::new();

            for op_is_borrow in &ops {
                if *op_is_borrow {
                    // Borrow (may fail when exhausted — that is fine)
                    if let Ok(obj) = pool.borrow_object().await {
                        held.push(obj);
                    }
                } else if let Some(obj) = held.pop() {
                    pool.return_object(obj).await.unwrap();
                }

                let stats = pool.stats();
                prop_assert!(
                    stats.active + stats.idle <= max_total,
                    "invariant violated: active={} + idle={} > max_total={}",
                    stats.active, stats.idle, max_total,
                );
            }

            // Return everything and verify conservation.
            for obj in held.drain(..) {
                pool.return_object(obj).await.unwrap();
            }
            let stats = pool.stats();
            prop_assert_eq!(stats.active, 0);
            prop_assert_eq!(stats.created - stats.destroyed, stats.idle as u64);

            Ok(())
        })?;
    }
}

/// Deterministic cycle test: borrowing and returning one object many
/// times creates it exactly once.
#[tokio::test]
async fn rapid_cycles_reuse_a_single_object() {
    let pool = ObjectPool::new(Arc::new(CountingFactory::new()), PoolConfig::default()).unwrap();

    for _ in 0..50 {
        let obj = pool.borrow_object().await.unwrap();
        pool.return_object(obj).await.unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.borrowed, 50);
    assert_eq!(stats.returned, 50);
}

/// Concurrent borrowers never exceed capacity.
#[tokio::test]
async fn concurrent_borrowers_respect_max_total() {
    let config = PoolConfig {
        max_total: 3,
        max_wait: Some(Duration::from_secs(2)),
        ..Default::default()
    };
    let pool = ObjectPool::new(Arc::new(CountingFactory::new()), config).unwrap();

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let obj = pool.borrow_object().await.unwrap();
            assert!(pool.num_active() <= 3);
            tokio::time::sleep(Duration::from_millis(5)).await;
            pool.return_object(obj).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert!(stats.created <= 3);
}
