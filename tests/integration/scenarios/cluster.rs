//! Cluster integration tests
//!
//! Group and shard resolution, lazy pool creation and custom drivers.

use crate::integration::helpers::fixtures::{file_manager, remote_config};
use crate::integration::MockKv;
use mimir::config::ShardConfig;
use mimir::{
    BackendError, CacheError, Cluster, ClusterError, Config, Driver, DriverTable, FileDriver, Manager,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test]
async fn test_unknown_group_and_shard() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_manager(dir.path(), 1, 0.5);
    let mut scope = manager.scope();

    let Err(err) = manager.connection(&mut scope, None, Some("archive")).await else {
        panic!("Expected unknown group error");
    };
    assert!(matches!(
        err,
        CacheError::Cluster(ClusterError::UnknownGroup { ref group }) if group == "archive"
    ));

    let Err(err) = manager.connection(&mut scope, Some("nope"), Some("slave")).await else {
        panic!("Expected unknown shard error");
    };
    assert!(matches!(
        err,
        CacheError::Cluster(ClusterError::UnknownShard { ref group, ref key }) if group == "slave" && key == "nope"
    ));
    assert!(scope.is_empty());
}

#[tokio::test]
async fn test_unknown_driver_fails_construction() {
    let yaml = r#"
groups:
  master:
    shards:
      default: { type: memcached, server: "127.0.0.1:11211" }
"#;
    let config = Config::from_yaml_str(yaml).unwrap();

    match Manager::new(config) {
        Err(CacheError::Cluster(ClusterError::UnknownDriver { group, key, driver })) => {
            assert_eq!((group.as_str(), key.as_str(), driver.as_str()), ("master", "default", "memcached"));
        }
        Err(other) => panic!("Expected unknown driver, got {}", other),
        Ok(_) => panic!("Expected unknown driver to fail"),
    }
}

#[tokio::test]
async fn test_pools_connect_on_first_use_only() {
    let mock = MockKv::new().await.unwrap();
    let manager = Manager::new(remote_config(mock.port(), 2, "")).unwrap();

    // Building the manager and resolving shards opens nothing
    assert!(manager.cluster().resolve(None, None).is_ok());
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(mock.stats().connections, 0);
    assert!(manager.stats().is_empty());

    let mut scope = manager.scope();
    manager.has(&mut scope, "k").await.unwrap();
    assert_eq!(mock.stats().connections, 2);

    let stats = manager.stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].name, "master/default");
    assert_eq!(stats[0].driver, "remote");
    assert_eq!(stats[0].state.outstanding, 1);
    assert!(stats[0].to_string().starts_with("master/default (remote): 2/2 connections"));
}

#[tokio::test]
async fn test_stats_are_sorted_by_pool_name() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_manager(dir.path(), 1, 0.5);
    let mut scope = manager.scope();

    manager.slave(&mut scope, None).await.unwrap();
    manager.connection(&mut scope, Some("k"), Some("master")).await.unwrap();
    manager.connection(&mut scope, Some("default"), Some("master")).await.unwrap();

    // An unqualified master call sticks to the last master shard
    manager.master(&mut scope, None).await.unwrap();

    let names: Vec<String> = manager.stats().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["master/default", "master/k", "slave/default"]);
}

#[tokio::test]
async fn test_custom_driver_table() {
    let dir = tempfile::tempdir().unwrap();
    let built = Arc::new(AtomicUsize::new(0));

    let mut drivers = DriverTable::new();
    let counter = Arc::clone(&built);
    drivers.register("scratch", move |shard| {
        counter.fetch_add(1, Ordering::SeqCst);
        let shard = ShardConfig {
            driver: "file".to_string(),
            ..shard.clone()
        };
        Ok(Arc::new(FileDriver::from_shard(&shard)?) as Arc<dyn Driver>)
    });

    let yaml = format!(
        r#"
groups:
  scratch:
    shards:
      default: {{ type: scratch, path: "{}" }}
"#,
        dir.path().display()
    );
    let config = Config::from_yaml_str(&yaml).unwrap();
    let cluster = Cluster::new(config.clone(), drivers.clone()).unwrap();
    assert_eq!(built.load(Ordering::SeqCst), 0);

    cluster.pool("scratch", "default").unwrap();
    cluster.pool("scratch", "default").unwrap();
    assert_eq!(built.load(Ordering::SeqCst), 1);

    // The built-in table does not know the driver
    assert!(matches!(
        Cluster::new(config.clone(), DriverTable::builtin()),
        Err(ClusterError::UnknownDriver { .. })
    ));

    let manager = Manager::with_drivers(config, drivers).unwrap();
    let mut scope = manager.scope();
    assert_eq!(manager.incr(&mut scope, "n", 2).await.unwrap(), 2);
}

#[tokio::test]
async fn test_driver_build_failure_is_reported() {
    let mut drivers = DriverTable::new();
    drivers.register("broken", |_shard| {
        Err(BackendError::InvalidConfig("missing endpoint".to_string()))
    });

    let config = Config::from_yaml_str(
        r#"
groups:
  master:
    shards:
      default: { type: broken }
"#,
    )
    .unwrap();
    let manager = Manager::with_drivers(config, drivers).unwrap();
    let mut scope = manager.scope();

    match manager.get(&mut scope, "k").await {
        Err(CacheError::Cluster(ClusterError::Driver { pool, source })) => {
            assert_eq!(pool, "master/default");
            assert!(source.to_string().contains("missing endpoint"));
        }
        other => panic!("Expected driver error, got {:?}", other),
    }
}
