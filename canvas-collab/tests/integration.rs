//! End-to-end sync between sessions through an in-process authority and
//! over real WebSockets.

use std::sync::Arc;

use canvas_collab::{
    Authority, AuthorityConfig, CanvasStore, CollabConfig, ConnectionState, MemoryConnector,
    SessionHandle, SessionManager, StoreConfig,
};
use canvas_core::{CanvasId, Credential, Intent, Replica, ReplicaId, ROOT};
use serde_json::json;
use tempfile::TempDir;
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(5);

fn client(authority: &Authority) -> (SessionManager, Arc<MemoryConnector>) {
    let connector = Arc::new(MemoryConnector::new(authority.clone()));
    let manager = SessionManager::new(CollabConfig::for_testing(), connector.clone());
    (manager, connector)
}

async fn open(manager: &SessionManager, canvas: &str) -> SessionHandle {
    manager.acquire(canvas, Credential::new("token")).await.unwrap()
}

async fn synced(handle: &SessionHandle) {
    let mut states = handle.watch_state();
    timeout(WAIT, states.wait_for(|s| s.is_synced()))
        .await
        .expect("session did not sync")
        .unwrap();
}

/// Poll until `check` holds.
async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_two_sessions_exchange_updates() {
    let authority = Authority::in_memory();
    let (m1, _) = client(&authority);
    let (m2, _) = client(&authority);
    let a = open(&m1, "board").await;
    let b = open(&m2, "board").await;
    synced(&a).await;
    synced(&b).await;

    let op = a
        .local_mutate(Intent::insert(ROOT, None, "rect").with_attribute("fill", json!("red")))
        .unwrap();
    eventually(|| b.query(op.id).is_some()).await;
    assert_eq!(b.query(op.id).unwrap().attributes["fill"], json!("red"));

    b.local_mutate(Intent::set(op.id, "fill", json!("blue")))
        .unwrap();
    eventually(|| a.query(op.id).unwrap().attributes["fill"] == json!("blue")).await;

    a.release().await;
    b.release().await;
}

#[tokio::test]
async fn test_concurrent_inserts_order_identically() {
    let authority = Authority::in_memory();
    let (m1, _) = client(&authority);
    let (m2, offline) = client(&authority);
    offline.set_online(false);

    let one = open(&m1, "scenario-a").await;
    let two = open(&m2, "scenario-a").await;
    synced(&one).await;

    let x = one.local_mutate(Intent::insert(ROOT, None, "x")).unwrap();
    let y = two.local_mutate(Intent::insert(ROOT, None, "y")).unwrap();
    one.force_sync(WAIT).await.unwrap();

    offline.set_online(true);
    synced(&two).await;
    two.force_sync(WAIT).await.unwrap();

    eventually(|| one.children(ROOT).len() == 2 && two.children(ROOT).len() == 2).await;
    let order = one.children(ROOT);
    assert_eq!(order, two.children(ROOT));
    assert!(order.contains(&x.id) && order.contains(&y.id));
    assert_eq!(one.visible_nodes(), two.visible_nodes());

    // Same order as a bare replica receiving the ops the other way round
    let mut reference = Replica::new(ReplicaId::random());
    reference.integrate(vec![y, x]);
    assert_eq!(reference.children(ROOT), order);

    one.release().await;
    two.release().await;
}

#[tokio::test]
async fn test_concurrent_attribute_writes_pick_one_winner() {
    let authority = Authority::in_memory();
    let (m1, _) = client(&authority);
    let (m2, link2) = client(&authority);
    let one = open(&m1, "scenario-b").await;
    let two = open(&m2, "scenario-b").await;
    synced(&one).await;
    synced(&two).await;

    let node = one.local_mutate(Intent::insert(ROOT, None, "frame")).unwrap().id;
    eventually(|| two.query(node).is_some()).await;

    link2.disconnect_all();
    eventually(|| two.connection_state() != ConnectionState::Synced).await;

    let wa = one.local_mutate(Intent::set(node, "title", json!("A"))).unwrap();
    let wb = two.local_mutate(Intent::set(node, "title", json!("B"))).unwrap();
    one.force_sync(WAIT).await.unwrap();

    link2.set_online(true);
    synced(&two).await;
    two.force_sync(WAIT).await.unwrap();

    let expected = if wa.id > wb.id { json!("A") } else { json!("B") };
    eventually(|| {
        let left = one.query(node).unwrap().attributes.get("title").cloned();
        let right = two.query(node).unwrap().attributes.get("title").cloned();
        left == right && left.as_ref() == Some(&expected)
    })
    .await;

    one.release().await;
    two.release().await;
}

#[tokio::test]
async fn test_truncated_authority_forces_full_resync() {
    let authority = Authority::in_memory();
    let canvas = CanvasId::parse("scenario-d").unwrap();
    let (m1, _) = client(&authority);
    let (m2, link2) = client(&authority);
    let writer = open(&m1, "scenario-d").await;
    let late = open(&m2, "scenario-d").await;
    synced(&writer).await;
    synced(&late).await;

    link2.disconnect_all();
    eventually(|| late.connection_state() != ConnectionState::Synced).await;
    for _ in 0..500 {
        if authority.peer_count(&canvas).await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(authority.peer_count(&canvas).await, 1);

    let keep = writer.local_mutate(Intent::insert(ROOT, None, "keep")).unwrap();
    let gone = writer.local_mutate(Intent::insert(ROOT, None, "gone")).unwrap();
    writer
        .local_mutate(Intent::set(keep.id, "label", json!("first")))
        .unwrap();
    writer
        .local_mutate(Intent::set(keep.id, "label", json!("second")))
        .unwrap();
    writer.local_mutate(Intent::delete(gone.id)).unwrap();
    writer.force_sync(WAIT).await.unwrap();

    let (truncated, _) = authority.compact(&canvas).await.unwrap();
    assert!(truncated > 0);

    link2.set_online(true);
    synced(&late).await;
    eventually(|| late.visible_nodes() == writer.visible_nodes()).await;
    assert_eq!(
        late.query(keep.id).unwrap().attributes["label"],
        json!("second")
    );
    assert!(late.query(gone.id).is_none());
    assert!(authority.resync_count() >= 1);

    // Writes after the resync still flow both ways
    let after = late.local_mutate(Intent::insert(ROOT, None, "after")).unwrap();
    eventually(|| writer.query(after.id).is_some()).await;

    writer.release().await;
    late.release().await;
}

#[tokio::test]
async fn test_reacquire_waits_for_teardown() {
    // The room closes between the two sessions, so the authority needs a store
    let dir = TempDir::new().unwrap();
    let store = CanvasStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let authority = Authority::with_store(AuthorityConfig::default(), Some(Arc::new(store)));
    let (manager, _) = client(&authority);
    let first = open(&manager, "handover").await;
    synced(&first).await;
    let op = first.local_mutate(Intent::insert(ROOT, None, "rect")).unwrap();
    let first_id = first.replica_id();

    let (_, second) = tokio::join!(first.release(), open(&manager, "handover"));
    assert_ne!(second.replica_id(), first_id);

    // The final flush of the first session reached the authority before
    // the second one handshook.
    synced(&second).await;
    eventually(|| second.query(op.id).is_some()).await;
    second.release().await;
}

#[tokio::test]
async fn test_sync_over_websocket() {
    let port = free_port().await;
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap();
    let authority = Authority::in_memory();
    {
        let authority = authority.clone();
        tokio::spawn(async move { authority.serve(listener).await });
    }

    let config = CollabConfig {
        server_url: format!("ws://127.0.0.1:{port}"),
        ..CollabConfig::for_testing()
    };
    let m1 = SessionManager::websocket(config.clone());
    let m2 = SessionManager::websocket(config);
    let a = open(&m1, "wire").await;
    let b = open(&m2, "wire").await;
    synced(&a).await;
    synced(&b).await;

    let op = a.local_mutate(Intent::insert(ROOT, None, "text")).unwrap();
    eventually(|| b.query(op.id).is_some()).await;
    assert_eq!(authority.peer_count(&CanvasId::parse("wire").unwrap()).await, 2);

    a.release().await;
    b.release().await;
}
