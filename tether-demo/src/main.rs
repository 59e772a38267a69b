//! tether-demo — walks a client through an offline edit, a reconnect and a
//! collaborative conflict against an in-memory backend.
//!
//! Run with `RUST_LOG=debug cargo run -p tether-demo` to see the queue and
//! cache at work.

use log::info;
use serde_json::json;
use std::error::Error;
use std::sync::Arc;

use tether_sync::{
    merge_document, ConnectivityMonitor, FileKvStore, MemoryKvStore, MemoryRemoteStore,
    MutationRequest, QuerySpec, SubscriptionUpdate, SyncConfig, SyncCore, SyncError,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let data_dir = std::env::temp_dir().join("tether-demo");
    let remote = MemoryRemoteStore::new();
    remote.insert("prompts", "welcome", json!({ "title": "Welcome" }));
    remote.insert(
        "documents",
        "notes",
        json!({ "content": "first draft", "version": 1, "lastModifiedBy": "seed" }),
    );

    // ─── Offline edit ───────────────────────────────────────────
    let connectivity = ConnectivityMonitor::new(false);
    let core = SyncCore::open(
        SyncConfig::default(),
        Arc::new(FileKvStore::open(&data_dir)?),
        Arc::new(remote.clone()),
        connectivity.clone(),
    )?;
    info!("Queue restored from {}", data_dir.display());

    let listing = core
        .subscribe_query(
            "prompts:list",
            QuerySpec::new("prompts"),
            Arc::new(|update| match update {
                SubscriptionUpdate::Snapshot(view) => {
                    info!("prompts:list now has {} documents", view.data.len())
                }
                SubscriptionUpdate::Error(error) => log::warn!("prompts:list failed: {error}"),
            }),
        )
        .await?;

    let rename = core.mutate_optimistic(
        "prompts:list",
        merge_document("welcome", json!({ "title": "Welcome back" })),
        MutationRequest::update("prompts", "welcome", json!({ "title": "Welcome back" })),
    )?;
    if let Some(view) = core.read_cache("prompts:list") {
        println!(
            "offline read: {} ({} pending)",
            view.data[0].data["title"], view.pending_mutations
        );
    }

    // ─── Reconnect ──────────────────────────────────────────────
    connectivity.set_online(true);
    let view = rename.settled().await?;
    println!(
        "after reconnect: {} ({} pending)",
        view.data[0].data["title"], view.pending_mutations
    );
    core.unsubscribe_query(listing);

    // ─── Collaborative conflict ─────────────────────────────────
    let other = SyncCore::open(
        SyncConfig::default(),
        Arc::new(MemoryKvStore::new()),
        Arc::new(remote.clone()),
        ConnectivityMonitor::new(true),
    )?;
    let mine = core.conflicts().watch_document("notes").await?;
    let theirs = other.conflicts().watch_document("notes").await?;

    let receipt = other.propose_collaborative_write("notes", 1, json!("their edit"), "bob")?;
    receipt.operation.delivered().await?;
    println!("bob saved v{}", receipt.version);

    match core.propose_collaborative_write("notes", 1, json!("my edit"), "alice") {
        Err(SyncError::Conflict(info)) => println!(
            "alice is behind: expected v{}, server has v{} ({})",
            info.expected_version, info.server_version, info.server_content
        ),
        Ok(receipt) => println!("alice saved v{}", receipt.version),
        Err(err) => return Err(err.into()),
    }

    core.conflicts().unwatch(mine);
    other.conflicts().unwatch(theirs);
    core.shutdown();
    other.shutdown();
    Ok(())
}
