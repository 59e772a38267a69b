//! Realtime subscription integration tests.
//!
//! Verifies:
//! - Two subscribers to one query share one remote listener, torn down once
//! - Pushes reach the cache before consumers see them
//! - Listener errors stay with their own query key
//! - Subscribed entries are never evicted as stale

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tether_sync::remote::OrderDirection;
use tether_sync::{
    ConnectivityMonitor, MemoryKvStore, MemoryRemoteStore, QueryOptions, QuerySpec, RemoteError,
    SubscriptionState, SubscriptionUpdate, SyncConfig, SyncCore, UpdateCallback,
};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_core(remote: &MemoryRemoteStore) -> SyncCore {
    SyncCore::open(
        SyncConfig::for_testing(),
        Arc::new(MemoryKvStore::new()),
        Arc::new(remote.clone()),
        ConnectivityMonitor::new(true),
    )
    .unwrap()
}

#[derive(Default, Clone)]
struct Recorder {
    titles: Arc<Mutex<Vec<Vec<String>>>>,
    errors: Arc<Mutex<Vec<RemoteError>>>,
}

impl Recorder {
    fn callback(&self) -> UpdateCallback {
        let recorder = self.clone();
        Arc::new(move |update| match update {
            SubscriptionUpdate::Snapshot(view) => recorder.titles.lock().unwrap().push(
                view.data
                    .iter()
                    .filter_map(|doc| doc.data["title"].as_str().map(str::to_string))
                    .collect(),
            ),
            SubscriptionUpdate::Error(error) => recorder.errors.lock().unwrap().push(error),
        })
    }

    fn last_titles(&self) -> Vec<String> {
        self.titles.lock().unwrap().last().cloned().unwrap_or_default()
    }

    fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }
}

fn list_spec() -> QuerySpec {
    QuerySpec::new("prompts")
        .with_options(QueryOptions::new().order_by("title", OrderDirection::Ascending))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_subscribers_share_one_listener() {
    let remote = MemoryRemoteStore::new();
    remote.insert("prompts", "p1", json!({ "title": "Beta" }));
    let core = open_core(&remote);

    let (first, second) = (Recorder::default(), Recorder::default());
    let a = core
        .subscribe_query("prompts:list", list_spec(), first.callback())
        .await
        .unwrap();
    let b = core
        .subscribe_query("prompts:list", list_spec(), second.callback())
        .await
        .unwrap();
    assert_eq!(remote.listeners_opened(), 1);
    assert_eq!(core.subscriptions().ref_count("prompts:list"), 2);

    remote.insert("prompts", "p2", json!({ "title": "Alpha" }));
    assert_eq!(first.last_titles(), vec!["Alpha", "Beta"]);
    assert_eq!(second.last_titles(), vec!["Alpha", "Beta"]);

    let cached = core.read_cache("prompts:list").unwrap();
    assert_eq!(cached.data.len(), 2);

    assert!(core.unsubscribe_query(a));
    assert_eq!(remote.listeners_closed(), 0);
    assert!(core.unsubscribe_query(b));
    assert_eq!(remote.listeners_closed(), 1);
    assert_eq!(remote.active_listeners(), 0);
    assert_eq!(
        core.subscriptions().state("prompts:list"),
        SubscriptionState::Unsubscribed
    );

    // Resubscribing opens a fresh listener
    let c = core
        .subscribe_query("prompts:list", list_spec(), Recorder::default().callback())
        .await
        .unwrap();
    assert_eq!(remote.listeners_opened(), 2);
    core.unsubscribe_query(c);
    assert_eq!(remote.listeners_closed(), 2);
}

#[tokio::test]
async fn test_errors_reach_only_their_key() {
    let remote = MemoryRemoteStore::new();
    let core = open_core(&remote);
    let (prompts, users) = (Recorder::default(), Recorder::default());

    let a = core
        .subscribe_query("prompts:list", list_spec(), prompts.callback())
        .await
        .unwrap();
    let b = core
        .subscribe_query("users:list", QuerySpec::new("users"), users.callback())
        .await
        .unwrap();

    remote.emit_error("prompts", RemoteError::permission_denied("rules changed"));
    assert_eq!(prompts.error_count(), 1);
    assert_eq!(users.error_count(), 0);

    // The other listener keeps delivering
    remote.insert("users", "u1", json!({ "title": "Ada" }));
    assert_eq!(users.last_titles(), vec!["Ada"]);

    core.unsubscribe_query(a);
    core.unsubscribe_query(b);
}

#[tokio::test(start_paused = true)]
async fn test_subscribed_entries_are_not_evicted() {
    let remote = MemoryRemoteStore::new();
    remote.insert("prompts", "p1", json!({ "title": "Only" }));
    let core = open_core(&remote);

    let handle = core
        .subscribe_query("prompts:list", list_spec(), Recorder::default().callback())
        .await
        .unwrap();
    core.cache().apply_snapshot("orphan", vec![]);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(core.cache().evict_expired(), vec!["orphan".to_string()]);
    assert!(core.read_cache("prompts:list").is_some());

    core.unsubscribe_query(handle);
    assert!(core.read_cache("prompts:list").is_none());
}
