//! Pool integration tests
//!
//! Pools in front of a live (mock) server: bounded connection count,
//! exhaustion timing and replacement of broken connections.

use crate::integration::{MockKv, ResponseMode};
use mimir::config::ShardConfig;
use mimir::{Driver, Pool, PoolError, RemoteDriver};
use rstest::rstest;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn remote_pool(mock: &MockKv, capacity: u32, timeout: Duration) -> Arc<Pool> {
    let shard = ShardConfig::new("remote").with_option("port", mock.port());
    let driver: Arc<dyn Driver> = Arc::new(RemoteDriver::from_shard(&shard).unwrap());
    Arc::new(Pool::new("master/default", driver, capacity, timeout))
}

#[rstest]
#[case(1)]
#[case(3)]
#[case(8)]
#[tokio::test]
async fn test_pool_never_opens_more_than_capacity(#[case] capacity: u32) {
    let mock = MockKv::new().await.unwrap();
    let pool = remote_pool(&mock, capacity, Duration::from_secs(2));

    let tasks: Vec<_> = (0..capacity * 4)
        .map(|i| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let mut lease = pool.acquire().await.unwrap();
                lease.incr("hits", 1).await.unwrap();
                let outstanding = pool.state().outstanding;
                tokio::time::sleep(Duration::from_millis(5 + u64::from(i % 3))).await;
                outstanding
            })
        })
        .collect();

    for task in tasks {
        assert!(task.await.unwrap() <= capacity);
    }

    assert_eq!(mock.stats().connections, capacity as usize);
    assert_eq!(mock.stored(0, "hits"), Some((capacity * 4).to_string().into_bytes()));
    assert_eq!(pool.state().idle, capacity);
}

#[tokio::test]
async fn test_pool_exhaustion_takes_about_the_timeout() {
    let mock = MockKv::new().await.unwrap();
    let pool = remote_pool(&mock, 2, Duration::from_millis(300));

    let _a = pool.acquire().await.unwrap();
    let _b = pool.acquire().await.unwrap();

    let started = Instant::now();
    let result = pool.acquire().await;
    let waited = started.elapsed();

    assert!(matches!(result, Err(PoolError::Exhausted { .. })));
    assert!(waited >= Duration::from_millis(280), "waited {:?}", waited);
    assert!(waited < Duration::from_secs(2), "waited {:?}", waited);
    assert_eq!(pool.state().outstanding, 2);
    assert_eq!(mock.stats().connections, 2);
}

#[tokio::test]
async fn test_shorter_acquire_timeout() {
    let mock = MockKv::new().await.unwrap();
    let pool = remote_pool(&mock, 1, Duration::from_secs(5));
    let _held = pool.acquire().await.unwrap();

    let started = Instant::now();
    match pool.acquire_within(Duration::from_millis(100)).await {
        Err(PoolError::Exhausted { timeout, .. }) => assert_eq!(timeout, Duration::from_millis(100)),
        other => panic!("Expected exhaustion, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_broken_remote_connection_is_replaced() {
    let mock = MockKv::new().await.unwrap();
    let pool = remote_pool(&mock, 1, Duration::from_secs(2));

    let mut lease = pool.acquire().await.unwrap();
    let broken_id = lease.id();

    mock.set_response_mode(ResponseMode::Failure);
    assert!(lease.get("k").await.is_err());
    assert!(lease.is_broken());
    mock.set_response_mode(ResponseMode::Normal);
    pool.release(lease);

    let mut lease = pool.acquire().await.unwrap();
    assert_ne!(lease.id(), broken_id);
    assert!(lease.ping().await.is_ok());
    assert_eq!(mock.stats().connections, 2);
    assert_eq!(pool.state().connections, 1);
}
