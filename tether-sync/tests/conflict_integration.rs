//! Collaborative editing integration tests.
//!
//! Two clients share one remote store but have separate local queues.
//!
//! Verifies:
//! - A stale proposal is refused with the server's content attached
//! - A write made offline on an old version cannot overwrite the server copy
//! - Debounced sessions send one write for a burst of edits
//! - Presence propagates between clients without bumping the version
//! - Concurrent joins from different clients are all kept

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tether_sync::remote::RemoteMethod;
use tether_sync::{
    ConflictEvent, ConnectivityMonitor, DeadLetterReason, DeliveryOutcome, MemoryKvStore,
    MemoryRemoteStore, QueueEvent, SyncConfig, SyncCore, SyncError,
};
use tokio::sync::broadcast;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_core(remote: &MemoryRemoteStore) -> SyncCore {
    open_core_with(remote, true)
}

fn open_core_with(remote: &MemoryRemoteStore, online: bool) -> SyncCore {
    SyncCore::open(
        SyncConfig::for_testing(),
        Arc::new(MemoryKvStore::new()),
        Arc::new(remote.clone()),
        ConnectivityMonitor::new(online),
    )
    .unwrap()
}

fn seed(remote: &MemoryRemoteStore) {
    remote.insert(
        "documents",
        "doc1",
        json!({ "content": "draft", "version": 1, "lastModifiedBy": "seed" }),
    );
}

async fn next_delivery(events: &mut broadcast::Receiver<QueueEvent>) -> String {
    loop {
        match events.recv().await {
            Ok(QueueEvent::Delivered { id, .. }) => return id,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("queue closed"),
        }
    }
}

// ─── Version checks ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_second_writer_on_stale_version_conflicts() {
    let remote = MemoryRemoteStore::new();
    seed(&remote);
    let (a, b) = (open_core(&remote), open_core(&remote));
    let watch_a = a.conflicts().watch_document("doc1").await.unwrap();
    let watch_b = b.conflicts().watch_document("doc1").await.unwrap();
    assert_eq!(a.conflicts().current_version("doc1"), 1);
    assert_eq!(b.conflicts().current_version("doc1"), 1);

    let receipt = a
        .propose_collaborative_write("doc1", 1, json!("alice's text"), "alice")
        .unwrap();
    assert_eq!(receipt.version, 2);
    assert!(receipt.operation.outcome().await.unwrap().is_delivered());

    // B learned about v2 through its watch
    assert_eq!(b.conflicts().current_version("doc1"), 2);

    let mut events = b.conflicts().subscribe_events();
    let info = match b.propose_collaborative_write("doc1", 1, json!("bob's text"), "bob") {
        Err(SyncError::Conflict(info)) => info,
        other => panic!("expected a conflict, got {other:?}"),
    };
    assert_eq!(info.expected_version, 1);
    assert_eq!(info.server_version, 2);
    assert_eq!(info.server_content, json!("alice's text"));
    assert_eq!(info.server_modified_by.as_deref(), Some("alice"));
    assert_eq!(info.local_content, json!("bob's text"));
    assert!(matches!(events.try_recv(), Ok(ConflictEvent::Conflict(_))));

    // Nothing of B's reached the server
    assert_eq!(remote.calls_for(RemoteMethod::Update).len(), 1);
    assert_eq!(
        remote.document("documents", "doc1").unwrap()["version"],
        json!(2)
    );

    // Rebased on the version it was told about, B's write goes through
    let rebased = b
        .propose_collaborative_write("doc1", 2, json!("bob's text"), "bob")
        .unwrap();
    assert!(rebased.operation.outcome().await.unwrap().is_delivered());
    assert_eq!(a.conflicts().current_version("doc1"), 3);

    a.conflicts().unwatch(watch_a);
    b.conflicts().unwatch(watch_b);
}

#[tokio::test]
async fn test_offline_write_on_old_version_is_refused_on_reconnect() {
    let remote = MemoryRemoteStore::new();
    seed(&remote);
    let a = open_core(&remote);
    let b = open_core_with(&remote, false);
    let watch_a = a.conflicts().watch_document("doc1").await.unwrap();
    let watch_b = b.conflicts().watch_document("doc1").await.unwrap();
    assert_eq!(b.conflicts().current_version("doc1"), 1);

    // B stops hearing from the server while A moves the document to v2
    b.conflicts().unwatch(watch_b);
    let receipt = a
        .propose_collaborative_write("doc1", 1, json!("alice's text"), "alice")
        .unwrap();
    assert!(receipt.operation.outcome().await.unwrap().is_delivered());

    // Both of B's offline writes pass the local check; the second builds on the first
    let mut events = b.conflicts().subscribe_events();
    let first = b
        .propose_collaborative_write("doc1", 1, json!("bob's text"), "bob")
        .unwrap();
    let second = b
        .propose_collaborative_write("doc1", 2, json!("bob's second text"), "bob")
        .unwrap();
    assert_eq!(b.conflicts().current_version("doc1"), 3);

    b.connectivity().set_online(true);
    assert!(matches!(
        first.operation.outcome().await.unwrap(),
        DeliveryOutcome::Conflict(_)
    ));
    assert!(matches!(
        second.operation.outcome().await.unwrap(),
        DeliveryOutcome::Conflict(_)
    ));

    // A's v2 survived untouched
    let server = remote.document("documents", "doc1").unwrap();
    assert_eq!(server["content"], json!("alice's text"));
    assert_eq!(server["lastModifiedBy"], json!("alice"));
    assert_eq!(server["version"], json!(2));

    // B is back on the server copy, with both sides reported
    let doc = b.conflicts().document("doc1").unwrap();
    assert_eq!(doc.version, 2);
    assert_eq!(doc.content, json!("alice's text"));
    let conflicts: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            ConflictEvent::Conflict(info) => Some(info),
            _ => None,
        })
        .collect();
    assert_eq!(conflicts.len(), 2);
    assert!(conflicts.iter().all(|info| info.server_version == 2
        && info.server_content == json!("alice's text")
        && info.server_modified_by.as_deref() == Some("alice")));
    let first_info = conflicts
        .iter()
        .find(|info| info.local_content == json!("bob's text"))
        .unwrap();
    assert_eq!(first_info.expected_version, 1);

    let dead = b.queue().dead_letters();
    assert_eq!(dead.len(), 2);
    assert!(dead
        .iter()
        .all(|letter| letter.reason == DeadLetterReason::Conflict));

    // Rebased on what it now knows, B goes through
    let rebased = b
        .propose_collaborative_write("doc1", 2, json!("bob's text"), "bob")
        .unwrap();
    assert!(rebased.operation.outcome().await.unwrap().is_delivered());
    assert_eq!(a.conflicts().current_version("doc1"), 3);
    a.conflicts().unwatch(watch_a);
}

// ─── Sessions ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_debounced_session_sends_latest_draft_once() {
    let remote = MemoryRemoteStore::new();
    seed(&remote);
    let core = open_core(&remote);
    let watch = core.conflicts().watch_document("doc1").await.unwrap();
    let mut deliveries = core.queue().subscribe_events();

    let session = core.conflicts().edit_session("doc1", "alice");
    for text in ["d", "dr", "dra", "draft two"] {
        session.edit(json!(text));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(remote.calls_for(RemoteMethod::Update).is_empty());
    assert_eq!(session.pending_draft(), Some(json!("draft two")));

    next_delivery(&mut deliveries).await;
    let updates = remote.calls_for(RemoteMethod::Update);
    assert_eq!(updates.len(), 1);
    let payload = updates[0].payload.clone().unwrap();
    assert_eq!(payload["content"], json!("draft two"));
    assert_eq!(payload["version"], json!(2));
    assert_eq!(payload["lastModifiedBy"], json!("alice"));
    assert_eq!(payload["__precondition"]["version"], json!(1));
    assert_eq!(session.pending_draft(), None);
    assert_eq!(core.conflicts().current_version("doc1"), 2);

    core.conflicts().unwatch(watch);
}

// ─── Presence ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_presence_reaches_the_other_client() {
    let remote = MemoryRemoteStore::new();
    seed(&remote);
    let (a, b) = (open_core(&remote), open_core(&remote));
    let watch_a = a.conflicts().watch_document("doc1").await.unwrap();
    let watch_b = b.conflicts().watch_document("doc1").await.unwrap();

    let mut a_queue = a.queue().subscribe_events();
    let mut b_events = b.conflicts().subscribe_events();
    assert_eq!(a.conflicts().join("doc1", "alice").unwrap(), vec!["alice"]);
    next_delivery(&mut a_queue).await;

    assert_eq!(b.conflicts().collaborators("doc1"), vec!["alice"]);
    assert!(matches!(
        b_events.try_recv(),
        Ok(ConflictEvent::PresenceChanged { collaborators, .. }) if collaborators == vec!["alice"]
    ));

    let mut b_queue = b.queue().subscribe_events();
    assert_eq!(
        b.conflicts().join("doc1", "bob").unwrap(),
        vec!["alice", "bob"]
    );
    next_delivery(&mut b_queue).await;
    assert_eq!(a.conflicts().collaborators("doc1"), vec!["alice", "bob"]);

    // Presence never moves the version
    assert_eq!(a.conflicts().current_version("doc1"), 1);
    assert_eq!(b.conflicts().current_version("doc1"), 1);
    a.propose_collaborative_write("doc1", 1, json!("still fine"), "alice")
        .unwrap();

    a.conflicts().unwatch(watch_a);
    b.conflicts().unwatch(watch_b);
}

#[tokio::test]
async fn test_concurrent_offline_joins_are_all_kept() {
    let remote = MemoryRemoteStore::new();
    seed(&remote);
    let a = open_core_with(&remote, false);
    let b = open_core_with(&remote, false);
    let watch_a = a.conflicts().watch_document("doc1").await.unwrap();
    let watch_b = b.conflicts().watch_document("doc1").await.unwrap();

    // Each client only knows about its own user when it joins
    assert_eq!(a.conflicts().join("doc1", "alice").unwrap(), vec!["alice"]);
    assert_eq!(b.conflicts().join("doc1", "bob").unwrap(), vec!["bob"]);

    let mut a_queue = a.queue().subscribe_events();
    let mut b_queue = b.queue().subscribe_events();
    a.connectivity().set_online(true);
    b.connectivity().set_online(true);
    next_delivery(&mut a_queue).await;
    next_delivery(&mut b_queue).await;

    assert_eq!(
        remote.document("documents", "doc1").unwrap()["collaborators"],
        json!({ "alice": true, "bob": true })
    );
    assert_eq!(a.conflicts().collaborators("doc1"), vec!["alice", "bob"]);
    assert_eq!(b.conflicts().collaborators("doc1"), vec!["alice", "bob"]);

    // Leaving removes only the leaver
    let mut a_queue = a.queue().subscribe_events();
    a.conflicts().leave("doc1", "alice").unwrap();
    next_delivery(&mut a_queue).await;
    assert_eq!(
        remote.document("documents", "doc1").unwrap()["collaborators"],
        json!({ "bob": true })
    );
    assert_eq!(b.conflicts().collaborators("doc1"), vec!["bob"]);

    a.conflicts().unwatch(watch_a);
    b.conflicts().unwatch(watch_b);
}
