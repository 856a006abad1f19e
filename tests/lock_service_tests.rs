//! End-to-end use of the `canopy` facade
//!
//! Configuration comes from a `canopy.toml` on disk, locks are taken through
//! peers the way a storage engine would take them.

use canopy::{
    CanopyConfig, CoordinationPeer, LockError, LockMode, LockOptions, LockState, Path, PolicyKind,
    TidGenerator, CONFIG_FILE_NAME,
};
use std::time::Duration;
use tempfile::TempDir;

fn path(s: &str) -> Path {
    s.parse().unwrap()
}

fn config_in(dir: &TempDir, toml: &str) -> CanopyConfig {
    let file = dir.path().join(CONFIG_FILE_NAME);
    std::fs::write(&file, toml).unwrap();
    CanopyConfig::from_file(&file).unwrap()
}

#[tokio::test]
async fn hierarchical_writers_share_the_tree() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir, "[lock]\npolicy = \"hierarchical\"\n");
    assert_eq!(config.lock.policy, PolicyKind::Hierarchical);

    let peer = CoordinationPeer::standalone(config).await.unwrap();
    let tids = TidGenerator::new();
    let (t1, t2) = (tids.create_tid(), tids.create_tid());

    let users = peer
        .lock(path("users/1"), t1.clone(), LockMode::Write, LockOptions::new())
        .await
        .unwrap();
    let posts = peer
        .lock(path("posts/1"), t2.clone(), LockMode::Write, LockOptions::new())
        .await
        .unwrap();
    assert_eq!(peer.manager().stats().active, 2);

    // the whole tree overlaps both writers
    let err = peer
        .lock(
            Path::root(),
            tids.create_tid(),
            LockMode::Read,
            LockOptions::new().timeout(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::Timeout { .. }));

    users.release().await.unwrap();
    posts.release().await.unwrap();
    peer.exit().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn expired_transaction_must_abort() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir, "[lock]\nlock_expiry_ms = 1000\n");
    let peer = CoordinationPeer::standalone(config).await.unwrap();
    let tid = TidGenerator::new().create_tid();

    let lock = peer
        .lock(path("doc"), tid.clone(), LockMode::Write, LockOptions::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let info = peer.manager().lock_info(lock.id()).unwrap();
    assert_eq!(info.state, LockState::Expired);

    let err = peer
        .lock(path("other"), tid.clone(), LockMode::Read, LockOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::ExpiredTid { .. }));

    // releasing the expired lock acknowledges the expiry
    assert!(matches!(lock.release().await, Err(LockError::Expired { .. })));
    let retry = peer
        .lock(path("other"), tid, LockMode::Read, LockOptions::new())
        .await
        .unwrap();
    retry.release().await.unwrap();
    peer.exit().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn processes_share_one_lock_table() {
    use canopy::Broker;

    let dir = TempDir::new().unwrap();
    let db = dir.path().join("app.db");
    let broker = Broker::bind(&db, CanopyConfig::default()).await.unwrap();
    let worker = CoordinationPeer::connect(&db, CanopyConfig::default())
        .await
        .unwrap();

    let local = broker
        .master()
        .lock(path("a"), "engine".into(), LockMode::Read, LockOptions::new())
        .await
        .unwrap();
    let remote = worker
        .lock(path("a"), "engine".into(), LockMode::Read, LockOptions::new())
        .await
        .unwrap();
    // same tid text, different processes: two distinct locks
    assert_ne!(local.id(), remote.id());
    assert_eq!(broker.master().manager().stats().active, 2);

    remote.release().await.unwrap();
    local.release().await.unwrap();
    worker.exit().await.unwrap();
    broker.shutdown().await.unwrap();
}
