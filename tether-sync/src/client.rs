//! Composition root.
//!
//! [`SyncCore`] builds every component from explicit dependencies and wires
//! them together; nothing is global, so tests can open as many isolated
//! cores as they like.
//!
//! ```text
//! mutate_optimistic(key, patch, request)
//!     ├─► cache.begin_mutation(key, patch)      (visible immediately)
//!     └─► queue.enqueue(request)                (durable, delivered when online)
//!              └─ outcome ─► confirm (Upsert | Merge | Remove) or rollback
//! ```

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::cache::{CacheCoordinator, CacheView, Confirmation, PatchFn, PendingMutation};
use crate::config::SyncConfig;
use crate::conflict::{ConflictDetector, WriteReceipt};
use crate::connectivity::ConnectivityMonitor;
use crate::error::SyncError;
use crate::queue::{MutationQueue, MutationRequest, OperationHandle, OperationKind};
use crate::remote::{RemoteDocument, RemoteDocumentStore};
use crate::storage::KeyValueStore;
use crate::subscription::{QuerySpec, SubscriptionHandle, SubscriptionManager, UpdateCallback};

pub struct SyncCore {
    config: SyncConfig,
    queue: MutationQueue,
    cache: CacheCoordinator,
    subscriptions: SubscriptionManager,
    conflicts: ConflictDetector,
    connectivity: ConnectivityMonitor,
    connectivity_task: JoinHandle<()>,
}

impl SyncCore {
    /// Open the core: restore the queue from `kv` and start following
    /// `connectivity`. Must be called from within a tokio runtime.
    pub fn open(
        config: SyncConfig,
        kv: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteDocumentStore>,
        connectivity: ConnectivityMonitor,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let queue = MutationQueue::open(config.queue.clone(), kv, remote.clone())?;
        let cache = CacheCoordinator::new(config.cache.clone());
        let subscriptions = SubscriptionManager::new(remote, cache.clone());
        let conflicts =
            ConflictDetector::new(config.collab.clone(), queue.clone(), subscriptions.clone());
        let connectivity_task = queue.attach_connectivity(connectivity.subscribe());

        log::info!(
            "Sync core opened: {} pending, {} dead-lettered",
            queue.pending_len(),
            queue.dead_letters().len()
        );
        Ok(Self {
            config,
            queue,
            cache,
            subscriptions,
            conflicts,
            connectivity,
            connectivity_task,
        })
    }

    /// Queue a write without touching the cache.
    pub fn enqueue_mutation(&self, request: MutationRequest) -> Result<OperationHandle, SyncError> {
        Ok(self.queue.enqueue(request)?)
    }

    pub fn read_cache(&self, query_key: &str) -> Option<CacheView> {
        self.cache.read(query_key)
    }

    pub async fn subscribe_query(
        &self,
        query_key: &str,
        spec: QuerySpec,
        on_update: UpdateCallback,
    ) -> Result<SubscriptionHandle, SyncError> {
        self.subscriptions.subscribe(query_key, spec, on_update).await
    }

    pub fn unsubscribe_query(&self, handle: SubscriptionHandle) -> bool {
        self.subscriptions.unsubscribe(handle)
    }

    pub fn propose_collaborative_write(
        &self,
        doc_id: &str,
        expected_version: u64,
        content: Value,
        author: &str,
    ) -> Result<WriteReceipt, SyncError> {
        self.conflicts
            .propose_write(doc_id, expected_version, content, author)
    }

    /// Apply `patch` to `query_key` optimistically and queue `request`.
    ///
    /// If the enqueue fails the patch is rolled back before returning.
    pub fn mutate_optimistic(
        &self,
        query_key: &str,
        patch: PatchFn,
        request: MutationRequest,
    ) -> Result<PendingWrite, SyncError> {
        let mutation = self.cache.begin_mutation(query_key, patch);
        match self.queue.enqueue(request.clone()) {
            Ok(operation) => Ok(PendingWrite {
                mutation,
                operation,
                request,
            }),
            Err(err) => {
                let err = SyncError::from(err);
                mutation.rollback(&err);
                Err(err)
            }
        }
    }

    /// Flush the queue now (no-op while offline).
    pub async fn flush(&self) {
        self.queue.flush().await;
    }

    /// Close every listener and stop following connectivity.
    pub fn shutdown(&self) {
        self.subscriptions.shutdown();
        self.connectivity_task.abort();
        log::info!("Sync core shut down");
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn cache(&self) -> &CacheCoordinator {
        &self.cache
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn conflicts(&self) -> &ConflictDetector {
        &self.conflicts
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }
}

impl Drop for SyncCore {
    fn drop(&mut self) {
        self.connectivity_task.abort();
    }
}

impl fmt::Debug for SyncCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCore")
            .field("online", &self.connectivity.is_online())
            .field("pending", &self.queue.pending_len())
            .field("cache", &self.cache)
            .finish()
    }
}

/// An optimistic write whose patch is applied and whose operation is queued.
///
/// Await [`settled`](Self::settled) (or [`detach`](Self::detach) it) to have
/// the cache reconciled with the outcome. Dropping it rolls the patch back,
/// although the queued operation is still delivered.
#[must_use = "dropping a pending write rolls back its optimistic patch"]
#[derive(Debug)]
pub struct PendingWrite {
    mutation: PendingMutation,
    operation: OperationHandle,
    request: MutationRequest,
}

impl PendingWrite {
    pub fn operation_id(&self) -> &str {
        self.operation.id()
    }

    /// Wait for delivery, then confirm or roll back the patch.
    pub async fn settled(self) -> Result<CacheView, SyncError> {
        let Self {
            mutation,
            operation,
            request,
        } = self;
        let query_key = mutation.query_key().to_string();

        match operation.delivered().await {
            Ok(remote_id) => {
                let view = mutation.confirm(confirmation_for(request, remote_id));
                Ok(view.unwrap_or_else(|| CacheView::empty(&query_key)))
            }
            Err(error) => {
                mutation.rollback(&error);
                Err(error)
            }
        }
    }

    /// Settle in the background.
    pub fn detach(self) -> JoinHandle<Result<CacheView, SyncError>> {
        tokio::spawn(self.settled())
    }
}

/// What the server holds after `request` was delivered.
fn confirmation_for(request: MutationRequest, remote_id: Option<String>) -> Confirmation {
    match (request.kind, remote_id.or(request.document_id)) {
        (OperationKind::Create, Some(id)) => {
            Confirmation::Upsert(vec![RemoteDocument::new(id, request.payload)])
        }
        (OperationKind::Update, Some(id)) => Confirmation::Merge {
            id,
            fields: request.payload,
        },
        (OperationKind::Delete, Some(id)) => Confirmation::Remove(vec![id]),
        (_, None) => Confirmation::Unchanged,
    }
}
