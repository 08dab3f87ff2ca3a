//! Per-scope affinity tests
//!
//! A scope reuses one connection per shard and hands every borrowed
//! connection back when it ends, however it ends.

use crate::integration::helpers::fixtures::file_manager;
use mimir::{AffinityToken, CacheError, Config, Manager, Value};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn outstanding(manager: &Manager) -> u32 {
    manager.stats().iter().map(|s| s.state.outstanding).sum()
}

// ============================================================================
// Capacity and blocking
// ============================================================================

#[tokio::test]
async fn test_third_task_waits_for_a_scope_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_manager(dir.path(), 2, 1.0);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let started = Instant::now();

    let mut tasks = Vec::new();
    for task in 0..3 {
        let manager = manager.clone();
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            let mut scope = manager.scope();
            manager
                .connection(&mut scope, Some("k"), Some("master"))
                .await
                .unwrap();
            tx.send((task, started.elapsed())).unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            scope.close();
        }));
    }
    drop(tx);

    let mut acquired = Vec::new();
    while let Some((_, elapsed)) = rx.recv().await {
        acquired.push(elapsed);
    }
    for task in tasks {
        task.await.unwrap();
    }

    acquired.sort();
    assert_eq!(acquired.len(), 3);
    assert!(acquired[0] < Duration::from_millis(200), "first: {:?}", acquired[0]);
    assert!(acquired[1] < Duration::from_millis(200), "second: {:?}", acquired[1]);
    assert!(acquired[2] >= Duration::from_millis(250), "third: {:?}", acquired[2]);
    assert!(acquired[2] < Duration::from_secs(1), "third: {:?}", acquired[2]);
    assert_eq!(outstanding(&manager), 0);
}

#[tokio::test]
async fn test_scopes_never_oversubscribe_a_pool() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_manager(dir.path(), 3, 2.0);

    let tasks: Vec<_> = (0..12)
        .map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                let mut scope = manager.scope();
                manager
                    .set(&mut scope, &format!("key{}", i), &Value::from(i), None)
                    .await
                    .unwrap();
                let out = outstanding(&manager);
                tokio::time::sleep(Duration::from_millis(20)).await;
                out
            })
        })
        .collect();

    for task in tasks {
        assert!(task.await.unwrap() <= 3);
    }

    let stats = manager.stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].metrics.connections_created, 3);
    assert_eq!(stats[0].metrics.acquisitions, 12);
    assert_eq!(stats[0].metrics.releases, 12);
}

// ============================================================================
// Connection reuse
// ============================================================================

#[tokio::test]
async fn test_same_token_same_connection_within_scope() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_manager(dir.path(), 2, 1.0);

    let mut first = manager.scope();
    let mut second = manager.scope();

    let a1 = manager.connection(&mut first, Some("k"), Some("master")).await.unwrap().id();
    let a2 = manager.connection(&mut first, Some("k"), Some("master")).await.unwrap().id();
    let b = manager.connection(&mut second, Some("k"), Some("master")).await.unwrap().id();

    assert_eq!(a1, a2);
    // Two scopes hold two different pooled connections
    assert_ne!(a1, b);
}

#[tokio::test]
async fn test_master_then_unqualified_set_goes_to_master() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_manager(dir.path(), 2, 1.0);

    let mut scope = manager.scope();
    manager.slave(&mut scope, None).await.unwrap();
    manager.master(&mut scope, None).await.unwrap();
    assert!(manager.set(&mut scope, "x", &Value::from(1), None).await.unwrap());
    assert_eq!(scope.last(), Some(&AffinityToken::new("master", "default")));
    scope.close();

    let mut check = manager.scope();
    manager.slave(&mut check, None).await.unwrap();
    assert_eq!(manager.get(&mut check, "x").await.unwrap(), None);
    manager.master(&mut check, None).await.unwrap();
    assert_eq!(manager.get(&mut check, "x").await.unwrap(), Some(Value::from(1)));
}

#[tokio::test]
async fn test_counter_starts_at_step() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_manager(dir.path(), 1, 1.0);
    let mut scope = manager.scope();

    assert_eq!(manager.incr(&mut scope, "counter", 1).await.unwrap(), 1);
    assert_eq!(manager.incr(&mut scope, "counter", 5).await.unwrap(), 6);
    assert_eq!(manager.decr(&mut scope, "counter", 2).await.unwrap(), 4);
}

#[tokio::test]
async fn test_expired_value_falls_back_to_default() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
groups:
  master:
    shards:
      default: {{ type: file, path: "{}", expire: 1 }}
"#,
        dir.path().display()
    );
    let manager = Manager::new(Config::from_yaml_str(&yaml).unwrap()).unwrap();
    let mut scope = manager.scope();

    manager.set(&mut scope, "a", &Value::from(42), None).await.unwrap();
    assert_eq!(manager.get(&mut scope, "a").await.unwrap(), Some(Value::from(42)));

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(
        manager.get_or(&mut scope, "a", Value::from("gone")).await.unwrap(),
        Value::from("gone")
    );
}

// ============================================================================
// Return on scope end
// ============================================================================

#[tokio::test]
async fn test_returned_connection_is_reused_by_next_scope() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_manager(dir.path(), 1, 0.5);

    let mut scope = manager.scope();
    let id = manager.connection(&mut scope, None, None).await.unwrap().id();
    scope.close();

    let mut next = manager.scope();
    assert_eq!(manager.connection(&mut next, None, None).await.unwrap().id(), id);

    let stats = manager.stats();
    assert_eq!(stats[0].metrics.releases, 1);
}

#[tokio::test]
async fn test_scope_dropped_on_error_returns_connection() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_manager(dir.path(), 1, 0.5);

    async fn failing_unit(manager: &Manager) -> Result<(), CacheError> {
        let mut scope = manager.scope();
        manager.set(&mut scope, "text", &Value::from("abc"), None).await?;
        // Not a number: the error propagates and the scope is dropped
        manager.incr(&mut scope, "text", 1).await?;
        Ok(())
    }

    let err = failing_unit(&manager).await.unwrap_err();
    assert!(matches!(err, CacheError::Backend(mimir::BackendError::NotNumeric { .. })));
    assert_eq!(outstanding(&manager), 0);

    let mut scope = manager.scope();
    assert!(manager.has(&mut scope, "text").await.unwrap());
}

#[tokio::test]
async fn test_aborted_task_returns_connection() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_manager(dir.path(), 1, 0.5);
    let (tx, rx) = tokio::sync::oneshot::channel();

    let task = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut scope = manager.scope();
            let id = manager.connection(&mut scope, None, None).await.unwrap().id();
            tx.send(id).unwrap();
            std::future::pending::<()>().await;
        })
    };

    let held_id = rx.await.unwrap();
    assert_eq!(outstanding(&manager), 1);

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert_eq!(outstanding(&manager), 0);

    let mut scope = manager.scope();
    let id = manager.connection(&mut scope, None, None).await.unwrap().id();
    assert_eq!(id, held_id);
}

#[tokio::test]
async fn test_timed_out_scope_holds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_manager(dir.path(), 1, 0.2);

    let mut holder = manager.scope();
    manager.master(&mut holder, None).await.unwrap();

    let mut waiter = manager.scope();
    let started = Instant::now();
    let err = manager.get(&mut waiter, "x").await.unwrap_err();
    let waited = started.elapsed();

    assert!(err.is_exhausted());
    assert!(waited >= Duration::from_millis(180), "waited {:?}", waited);
    assert!(waited < Duration::from_secs(1), "waited {:?}", waited);
    assert!(waiter.is_empty());

    holder.close();
    assert!(manager.get(&mut waiter, "x").await.unwrap().is_none());
}
