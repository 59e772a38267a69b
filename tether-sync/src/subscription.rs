//! Realtime subscription manager.
//!
//! One remote listener per query key, shared by every consumer of that key:
//!
//! ```text
//! subscribe(k) ─┬─ first consumer ──► Subscribing ──open──► Active
//!               └─ later consumers ─► join (current view handed over)
//!
//! remote push ──► cache.apply_snapshot(k) ──► every current consumer of k
//! remote error ─► every current consumer of k (other keys unaffected)
//!
//! unsubscribe ──► ref_count - 1 ──► at zero: entry removed, listener torn down
//! ```
//!
//! Consumer bookkeeping is synchronous; only opening the listener awaits
//! the network. Each entry carries a generation so callbacks from a listener
//! that has since been replaced are ignored.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use uuid::Uuid;

use crate::cache::{CacheCoordinator, CacheView};
use crate::error::{RemoteError, SyncError};
use crate::remote::{
    ErrorCallback, ListenerRegistration, QueryOptions, RemoteDocument, RemoteDocumentStore,
    SnapshotCallback,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionUpdate {
    /// Cache view after a snapshot was reconciled
    Snapshot(CacheView),
    /// The listener for this key reported an error
    Error(RemoteError),
}

/// Consumer callback.
pub type UpdateCallback = Arc<dyn Fn(SubscriptionUpdate) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Active,
}

/// What to listen to. The first subscriber's query opens the listener.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub collection: String,
    pub options: QueryOptions,
}

impl QuerySpec {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            options: QueryOptions::default(),
        }
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

/// Identifies one consumer of one query key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    query_key: String,
    consumer_id: Uuid,
}

impl SubscriptionHandle {
    pub fn query_key(&self) -> &str {
        &self.query_key
    }

    pub fn consumer_id(&self) -> Uuid {
        self.consumer_id
    }
}

struct Consumer {
    id: Uuid,
    on_update: UpdateCallback,
}

struct SubscriptionEntry {
    state: SubscriptionState,
    consumers: Vec<Consumer>,
    /// Present once the listener is open
    registration: Option<ListenerRegistration>,
    generation: u64,
}

impl SubscriptionEntry {
    fn callbacks(&self) -> Vec<(Uuid, UpdateCallback)> {
        self.consumers
            .iter()
            .map(|consumer| (consumer.id, consumer.on_update.clone()))
            .collect()
    }
}

struct SubscriptionInner {
    remote: Arc<dyn RemoteDocumentStore>,
    cache: CacheCoordinator,
    entries: Mutex<HashMap<String, SubscriptionEntry>>,
    next_generation: AtomicU64,
}

/// Deduplicates remote listeners and feeds their snapshots into the cache.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<SubscriptionInner>,
}

impl SubscriptionManager {
    pub fn new(remote: Arc<dyn RemoteDocumentStore>, cache: CacheCoordinator) -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                remote,
                cache,
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    fn from_inner(inner: Arc<SubscriptionInner>) -> Self {
        Self { inner }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, SubscriptionEntry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cache(&self) -> &CacheCoordinator {
        &self.inner.cache
    }

    /// Register a consumer for `query_key`, opening the remote listener if
    /// this is the first one.
    ///
    /// The first consumer waits for the listener to open and receives the
    /// open error, if any. Consumers joining while it opens return at once
    /// and are told about a failed open through their callback.
    pub async fn subscribe(
        &self,
        query_key: &str,
        spec: QuerySpec,
        on_update: UpdateCallback,
    ) -> Result<SubscriptionHandle, SyncError> {
        let handle = SubscriptionHandle {
            query_key: query_key.to_string(),
            consumer_id: Uuid::new_v4(),
        };
        let consumer = Consumer {
            id: handle.consumer_id,
            on_update: on_update.clone(),
        };

        let generation = {
            let mut entries = self.lock_entries();
            if let Some(entry) = entries.get_mut(query_key) {
                entry.consumers.push(consumer);
                let active = entry.state == SubscriptionState::Active;
                let ref_count = entry.consumers.len();
                drop(entries);

                log::debug!("Consumer joined {query_key} (ref_count={ref_count})");
                if active {
                    if let Some(view) = self.inner.cache.read(query_key) {
                        on_update(SubscriptionUpdate::Snapshot(view));
                    }
                }
                return Ok(handle);
            }

            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            entries.insert(
                query_key.to_string(),
                SubscriptionEntry {
                    state: SubscriptionState::Subscribing,
                    consumers: vec![consumer],
                    registration: None,
                    generation,
                },
            );
            generation
        };

        self.inner.cache.retain(query_key);
        log::info!("Opening listener for {query_key} on '{}'", spec.collection);

        let result = self
            .inner
            .remote
            .subscribe(
                &spec.collection,
                spec.options,
                self.snapshot_callback(query_key, generation),
                self.error_callback(query_key, generation),
            )
            .await;

        match result {
            Ok(registration) => {
                let orphaned = {
                    let mut entries = self.lock_entries();
                    match entries.get_mut(query_key) {
                        Some(entry) if entry.generation == generation => {
                            entry.state = SubscriptionState::Active;
                            entry.registration = Some(registration);
                            None
                        }
                        _ => Some(registration),
                    }
                };
                if let Some(registration) = orphaned {
                    log::debug!("Every consumer left {query_key} while opening; closing listener");
                    registration.remove();
                }
                Ok(handle)
            }
            Err(error) => {
                let waiting = {
                    let mut entries = self.lock_entries();
                    let owned = entries
                        .get(query_key)
                        .is_some_and(|entry| entry.generation == generation);
                    if owned {
                        entries
                            .remove(query_key)
                            .map(|entry| entry.callbacks())
                            .unwrap_or_default()
                    } else {
                        Vec::new()
                    }
                };
                if !waiting.is_empty() {
                    self.inner.cache.release(query_key);
                }
                log::warn!("Listener for {query_key} failed to open: {error}");

                for (consumer_id, callback) in waiting {
                    if consumer_id != handle.consumer_id {
                        callback(SubscriptionUpdate::Error(error.clone()));
                    }
                }
                Err(SyncError::Subscription(error))
            }
        }
    }

    fn snapshot_callback(&self, query_key: &str, generation: u64) -> SnapshotCallback {
        let inner: Weak<SubscriptionInner> = Arc::downgrade(&self.inner);
        let query_key = query_key.to_string();
        Arc::new(move |docs: Vec<RemoteDocument>| {
            if let Some(inner) = inner.upgrade() {
                SubscriptionManager::from_inner(inner).handle_snapshot(&query_key, generation, docs);
            }
        })
    }

    fn error_callback(&self, query_key: &str, generation: u64) -> ErrorCallback {
        let inner: Weak<SubscriptionInner> = Arc::downgrade(&self.inner);
        let query_key = query_key.to_string();
        Arc::new(move |error: RemoteError| {
            if let Some(inner) = inner.upgrade() {
                SubscriptionManager::from_inner(inner).handle_error(&query_key, generation, error);
            }
        })
    }

    fn current_callbacks(&self, query_key: &str, generation: u64) -> Option<Vec<(Uuid, UpdateCallback)>> {
        let entries = self.lock_entries();
        entries
            .get(query_key)
            .filter(|entry| entry.generation == generation)
            .map(SubscriptionEntry::callbacks)
    }

    fn is_member(&self, query_key: &str, generation: u64, consumer_id: Uuid) -> bool {
        self.lock_entries().get(query_key).is_some_and(|entry| {
            entry.generation == generation
                && entry.consumers.iter().any(|consumer| consumer.id == consumer_id)
        })
    }

    fn handle_snapshot(&self, query_key: &str, generation: u64, docs: Vec<RemoteDocument>) {
        let Some(callbacks) = self.current_callbacks(query_key, generation) else {
            log::trace!("Dropped snapshot for closed listener {query_key}");
            return;
        };

        log::debug!("Snapshot for {query_key}: {} documents", docs.len());
        let view = self.inner.cache.apply_snapshot(query_key, docs);
        for (consumer_id, callback) in callbacks {
            if self.is_member(query_key, generation, consumer_id) {
                callback(SubscriptionUpdate::Snapshot(view.clone()));
            }
        }
    }

    fn handle_error(&self, query_key: &str, generation: u64, error: RemoteError) {
        let Some(callbacks) = self.current_callbacks(query_key, generation) else {
            return;
        };

        log::warn!("Listener for {query_key} reported: {error}");
        for (consumer_id, callback) in callbacks {
            if self.is_member(query_key, generation, consumer_id) {
                callback(SubscriptionUpdate::Error(error.clone()));
            }
        }
    }

    /// Remove a consumer. The listener is torn down when the last consumer
    /// leaves. Returns `false` if the handle was not registered.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let query_key = handle.query_key.as_str();
        let registration = {
            let mut entries = self.lock_entries();
            let Some(entry) = entries.get_mut(query_key) else {
                return false;
            };
            let before = entry.consumers.len();
            entry.consumers.retain(|consumer| consumer.id != handle.consumer_id);
            if entry.consumers.len() == before {
                return false;
            }
            if !entry.consumers.is_empty() {
                log::debug!(
                    "Consumer left {query_key} (ref_count={})",
                    entry.consumers.len()
                );
                return true;
            }
            entries.remove(query_key).and_then(|entry| entry.registration)
        };

        self.inner.cache.release(query_key);
        match registration {
            Some(registration) => {
                log::info!("Closing listener for {query_key}");
                registration.remove();
            }
            None => log::debug!("Last consumer left {query_key} before its listener opened"),
        }
        true
    }

    /// Tear down every listener.
    pub fn shutdown(&self) {
        let drained: Vec<(String, Option<ListenerRegistration>)> = self
            .lock_entries()
            .drain()
            .map(|(key, entry)| (key, entry.registration))
            .collect();
        for (query_key, registration) in drained {
            self.inner.cache.release(&query_key);
            if let Some(registration) = registration {
                registration.remove();
            }
        }
    }

    pub fn state(&self, query_key: &str) -> SubscriptionState {
        self.lock_entries()
            .get(query_key)
            .map_or(SubscriptionState::Unsubscribed, |entry| entry.state)
    }

    pub fn ref_count(&self, query_key: &str) -> usize {
        self.lock_entries()
            .get(query_key)
            .map_or(0, |entry| entry.consumers.len())
    }

    pub fn active_queries(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .lock_entries()
            .iter()
            .filter(|(_, entry)| entry.state == SubscriptionState::Active)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("queries", &self.lock_entries().len())
            .finish()
    }
}
