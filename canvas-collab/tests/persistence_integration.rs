//! Local cache behaviour across process restarts.

use std::sync::Arc;

use canvas_collab::{
    Authority, CanvasStore, CollabConfig, MemoryConnector, SessionManager, StoreConfig,
};
use canvas_core::{CanvasId, Credential, Intent, Replica, ReplicaId, ROOT};
use serde_json::json;
use tempfile::TempDir;
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(5);

fn config(dir: &TempDir) -> CollabConfig {
    CollabConfig::for_testing().with_store(StoreConfig::for_testing(dir.path()))
}

#[tokio::test]
async fn test_offline_mutations_survive_restart_and_sync_once() {
    let dir = TempDir::new().unwrap();
    let canvas = CanvasId::parse("offline").unwrap();
    let authority = Authority::in_memory();
    let connector = Arc::new(MemoryConnector::new(authority.clone()));
    connector.set_online(false);

    let ids = {
        let manager = SessionManager::new(config(&dir), connector.clone());
        let handle = manager.acquire("offline", Credential::new("t")).await.unwrap();
        let mut ids = Vec::new();
        for i in 0..3 {
            let op = handle
                .local_mutate(Intent::insert(ROOT, None, "rect").with_attribute("i", json!(i)))
                .unwrap();
            ids.push(op.id);
        }
        handle.flush().await;

        let stored = manager.store().unwrap().load(&canvas).unwrap().unwrap();
        let logged: Vec<_> = stored.operations.iter().map(|op| op.id).collect();
        assert_eq!(logged, ids);
        handle.release().await;
        ids
    };

    // Restart with the network back
    connector.set_online(true);
    let manager = SessionManager::new(config(&dir), connector);
    let handle = manager.acquire("offline", Credential::new("t")).await.unwrap();
    let mut states = handle.watch_state();
    timeout(WAIT, states.wait_for(|s| s.is_synced()))
        .await
        .unwrap()
        .unwrap();
    handle.force_sync(WAIT).await.unwrap();

    let nodes = authority.visible_nodes(&canvas).await.unwrap();
    let delivered: Vec<_> = nodes.iter().filter(|n| ids.contains(&n.id)).collect();
    assert_eq!(delivered.len(), 3);
    // root plus the three rects, nothing twice
    assert_eq!(nodes.len(), 4);
    handle.release().await;
}

#[tokio::test]
async fn test_interrupted_save_keeps_previous_state() {
    let dir = TempDir::new().unwrap();
    let canvas = CanvasId::parse("crash").unwrap();
    let connector = Arc::new(MemoryConnector::new(Authority::in_memory()));
    connector.set_online(false);

    let kept = {
        let manager = SessionManager::new(config(&dir), connector.clone());
        let handle = manager.acquire("crash", Credential::new("t")).await.unwrap();
        let op = handle
            .local_mutate(Intent::insert(ROOT, None, "kept"))
            .unwrap();
        handle.release().await;

        // A save that stops before commit, as if the process died mid-write
        let store = manager.store().unwrap().clone();
        let mut other = Replica::new(ReplicaId::random());
        other
            .local_mutate(Intent::insert(ROOT, None, "half"))
            .unwrap();
        let mut txn = store.begin_save(&canvas);
        txn.put_snapshot(&other.snapshot()).unwrap();
        drop(txn);
        op.id
    };

    let manager = SessionManager::new(config(&dir), connector);
    assert!(manager.store().is_some());
    let handle = manager.acquire("crash", Credential::new("t")).await.unwrap();
    assert_eq!(handle.query(kept).unwrap().node_type, "kept");
    assert_eq!(handle.children(ROOT), vec![kept]);
    handle.release().await;
}

/// Overwrite the first log record of `canvas` with bytes that do not decode.
fn corrupt_first_record(dir: &TempDir, canvas: &CanvasId) {
    let opts = rocksdb::Options::default();
    let db = rocksdb::DB::open_cf(&opts, dir.path(), ["snapshots", "oplog", "sessions", "metadata"])
        .unwrap();
    let cf = db.cf_handle("oplog").unwrap();
    let mut key = vec![canvas.as_str().len() as u8];
    key.extend_from_slice(canvas.as_str().as_bytes());
    key.extend_from_slice(&0u64.to_be_bytes());
    db.put_cf(cf, key, [2u8, 0, 0, 0, 0xFF]).unwrap();
}

#[tokio::test]
async fn test_corrupt_cache_is_discarded_and_resynced() {
    let dir = TempDir::new().unwrap();
    let canvas = CanvasId::parse("corrupt").unwrap();
    let authority = Authority::in_memory();

    // The authority already holds the canvas through another peer
    let peer_connector = Arc::new(MemoryConnector::new(authority.clone()));
    let peer = SessionManager::new(CollabConfig::for_testing(), peer_connector);
    let remote = peer.acquire("corrupt", Credential::new("t")).await.unwrap();
    let node = remote
        .local_mutate(Intent::insert(ROOT, None, "remote"))
        .unwrap();
    remote.force_sync(WAIT).await.unwrap();

    {
        let store = CanvasStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let mut local = Replica::new(ReplicaId::random());
        let op = local.local_mutate(Intent::insert(ROOT, None, "local")).unwrap();
        store.append(&canvas, &[op]).unwrap();
    }
    corrupt_first_record(&dir, &canvas);

    let connector = Arc::new(MemoryConnector::new(authority.clone()));
    let manager = SessionManager::new(config(&dir), connector);
    let handle = manager.acquire("corrupt", Credential::new("t")).await.unwrap();
    assert!(handle.visible_nodes().iter().all(|n| n.node_type != "local"));

    let mut states = handle.watch_state();
    timeout(WAIT, states.wait_for(|s| s.is_synced()))
        .await
        .unwrap()
        .unwrap();
    let deadline = tokio::time::Instant::now() + WAIT;
    while handle.query(node.id).is_none() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    handle.release().await;
    remote.release().await;
}

#[tokio::test]
async fn test_unavailable_store_runs_in_memory() {
    let dir = TempDir::new().unwrap();
    // Holding the RocksDB lock makes the manager's own open fail
    let _held = CanvasStore::open(StoreConfig::for_testing(dir.path())).unwrap();

    let connector = Arc::new(MemoryConnector::new(Authority::in_memory()));
    let manager = SessionManager::new(config(&dir), connector);
    assert!(manager.store().is_none());

    let handle = manager.acquire("volatile", Credential::new("t")).await.unwrap();
    let op = handle
        .local_mutate(Intent::insert(ROOT, None, "rect"))
        .unwrap();
    assert!(handle.query(op.id).is_some());
    handle.release().await;
}
