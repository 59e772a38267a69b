//! Optimistic cache coordinator.
//!
//! Each query key maps to a cache entry:
//!
//! ```text
//!             confirmed (last server snapshot)
//!                  │
//!   pending patch 1 ─► pending patch 2 ─► ... ─► data (what readers see)
//! ```
//!
//! A mutation applies its patch synchronously, so the change is visible
//! before any network round trip. Settling the mutation either folds the
//! server's answer into `confirmed` and invalidates the query, or removes
//! the patch and restores the data it replaced. A server snapshot always
//! replaces `confirmed` and replays the still-pending patches on top, so
//! applying the same snapshot twice yields the same view.
//!
//! Patches must be idempotent against data that already contains their
//! effect; the helpers [`upsert_document`], [`merge_document`] and
//! [`remove_document`] are.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::error::SyncError;
use crate::remote::RemoteDocument;

/// Transformation applied to the cached documents of one query.
pub type PatchFn = Arc<dyn Fn(&mut Vec<RemoteDocument>) + Send + Sync>;

/// Insert `doc`, replacing any document with the same id.
pub fn upsert_document(doc: RemoteDocument) -> PatchFn {
    Arc::new(move |docs: &mut Vec<RemoteDocument>| apply_upsert(docs, doc.clone()))
}

/// Shallow-merge `fields` into the document `id`, if present.
pub fn merge_document(id: impl Into<String>, fields: Value) -> PatchFn {
    let id = id.into();
    Arc::new(move |docs: &mut Vec<RemoteDocument>| apply_merge(docs, &id, &fields))
}

pub fn remove_document(id: impl Into<String>) -> PatchFn {
    let id = id.into();
    Arc::new(move |docs: &mut Vec<RemoteDocument>| docs.retain(|doc| doc.id != id))
}

fn apply_upsert(docs: &mut Vec<RemoteDocument>, doc: RemoteDocument) {
    match docs.iter_mut().find(|existing| existing.id == doc.id) {
        Some(existing) => *existing = doc,
        None => docs.push(doc),
    }
}

fn apply_merge(docs: &mut [RemoteDocument], id: &str, fields: &Value) {
    let Some(doc) = docs.iter_mut().find(|doc| doc.id == id) else {
        return;
    };
    match (&mut doc.data, fields) {
        (Value::Object(existing), Value::Object(fields)) => {
            for (key, value) in fields {
                existing.insert(key.clone(), value.clone());
            }
        }
        (data, fields) => *data = fields.clone(),
    }
}

/// Server-confirmed result of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    /// Documents as stored by the server
    Upsert(Vec<RemoteDocument>),
    /// Fields the server accepted for one document
    Merge { id: String, fields: Value },
    /// Documents the server deleted
    Remove(Vec<String>),
    /// Nothing to fold in; wait for the next snapshot
    Unchanged,
}

impl Confirmation {
    fn apply(&self, docs: &mut Vec<RemoteDocument>) {
        match self {
            Confirmation::Upsert(confirmed) => {
                for doc in confirmed {
                    apply_upsert(docs, doc.clone());
                }
            }
            Confirmation::Merge { id, fields } => apply_merge(docs, id, fields),
            Confirmation::Remove(ids) => docs.retain(|doc| !ids.contains(&doc.id)),
            Confirmation::Unchanged => {}
        }
    }
}

/// Read-only view of one query's cached data.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheView {
    pub query_key: String,
    pub data: Vec<RemoteDocument>,
    pub pending_mutations: usize,
    pub last_snapshot_at: Option<Instant>,
    /// The query should be refetched; set after a mutation settles
    pub invalidated: bool,
}

impl CacheView {
    pub(crate) fn empty(query_key: &str) -> Self {
        Self {
            query_key: query_key.to_string(),
            data: Vec::new(),
            pending_mutations: 0,
            last_snapshot_at: None,
            invalidated: false,
        }
    }

    pub fn document(&self, id: &str) -> Option<&RemoteDocument> {
        self.data.iter().find(|doc| doc.id == id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Updated { query_key: String },
    RolledBack { query_key: String, reason: String },
    Invalidated { query_key: String },
    Evicted { query_key: String },
}

struct PendingPatch {
    id: u64,
    patch: PatchFn,
    /// Data as it was just before this patch was applied
    rollback_data: Vec<RemoteDocument>,
    base_generation: u64,
}

struct CacheEntry {
    confirmed: Option<Vec<RemoteDocument>>,
    data: Vec<RemoteDocument>,
    last_snapshot_at: Option<Instant>,
    touched_at: Instant,
    /// Bumped whenever `data` is rebuilt from `confirmed`
    generation: u64,
    pending: Vec<PendingPatch>,
    invalidated: bool,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            confirmed: None,
            data: Vec::new(),
            last_snapshot_at: None,
            touched_at: Instant::now(),
            generation: 0,
            pending: Vec::new(),
            invalidated: false,
        }
    }

    fn recompute(&mut self) {
        let mut data = self.confirmed.clone().unwrap_or_default();
        for pending in &self.pending {
            (pending.patch)(&mut data);
        }
        self.data = data;
    }

    fn view(&self, query_key: &str) -> CacheView {
        CacheView {
            query_key: query_key.to_string(),
            data: self.data.clone(),
            pending_mutations: self.pending.len(),
            last_snapshot_at: self.last_snapshot_at,
            invalidated: self.invalidated,
        }
    }

    fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_snapshot_at.unwrap_or(self.touched_at))
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    pins: HashMap<String, usize>,
    next_patch_id: u64,
}

impl CacheState {
    fn is_pinned(&self, query_key: &str) -> bool {
        self.pins.get(query_key).is_some_and(|count| *count > 0)
    }
}

enum Settlement {
    Confirm(Confirmation),
    Rollback(String),
}

struct CacheInner {
    config: CacheConfig,
    state: Mutex<CacheState>,
    events: broadcast::Sender<CacheEvent>,
}

/// Query cache with optimistic updates and rollback.
#[derive(Clone)]
pub struct CacheCoordinator {
    inner: Arc<CacheInner>,
}

impl CacheCoordinator {
    pub fn new(config: CacheConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(CacheInner {
                config,
                state: Mutex::new(CacheState::default()),
                events,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Current view of a query. An entry that has outlived the staleness
    /// window and is neither pinned nor mutating is evicted instead.
    pub fn read(&self, query_key: &str) -> Option<CacheView> {
        let window = self.inner.config.staleness_window();
        let mut state = self.lock_state();
        let expired = {
            let entry = state.entries.get(query_key)?;
            entry.pending.is_empty() && entry.age(Instant::now()) > window
        };
        if expired && !state.is_pinned(query_key) {
            state.entries.remove(query_key);
            drop(state);
            log::debug!("Evicted stale cache entry {query_key}");
            self.emit(CacheEvent::Evicted {
                query_key: query_key.to_string(),
            });
            return None;
        }
        state.entries.get(query_key).map(|entry| entry.view(query_key))
    }

    /// Replace the confirmed data of a query with a server snapshot and
    /// replay any pending patches on top.
    pub fn apply_snapshot(&self, query_key: &str, docs: Vec<RemoteDocument>) -> CacheView {
        let view = {
            let mut state = self.lock_state();
            let entry = state
                .entries
                .entry(query_key.to_string())
                .or_insert_with(CacheEntry::new);
            entry.confirmed = Some(docs);
            entry.generation += 1;
            entry.last_snapshot_at = Some(Instant::now());
            entry.invalidated = false;
            entry.recompute();
            entry.view(query_key)
        };
        self.emit(CacheEvent::Updated {
            query_key: query_key.to_string(),
        });
        view
    }

    /// Apply `patch` optimistically. The returned guard must be confirmed
    /// or rolled back; dropping it rolls back.
    pub fn begin_mutation(&self, query_key: &str, patch: PatchFn) -> PendingMutation {
        let patch_id = {
            let mut state = self.lock_state();
            state.next_patch_id += 1;
            let patch_id = state.next_patch_id;
            let entry = state
                .entries
                .entry(query_key.to_string())
                .or_insert_with(CacheEntry::new);

            let rollback_data = entry.data.clone();
            patch(&mut entry.data);
            entry.touched_at = Instant::now();
            entry.pending.push(PendingPatch {
                id: patch_id,
                patch,
                rollback_data,
                base_generation: entry.generation,
            });
            patch_id
        };
        log::trace!("Optimistic patch {patch_id} applied to {query_key}");
        self.emit(CacheEvent::Updated {
            query_key: query_key.to_string(),
        });

        PendingMutation {
            cache: self.clone(),
            query_key: query_key.to_string(),
            patch_id,
            settled: false,
        }
    }

    /// Run `commit` with `patch` applied optimistically, then confirm or
    /// roll back depending on its result. Cancelling the returned future
    /// rolls back too.
    pub async fn mutate<F>(
        &self,
        query_key: &str,
        patch: PatchFn,
        commit: F,
    ) -> Result<CacheView, SyncError>
    where
        F: Future<Output = Result<Confirmation, SyncError>>,
    {
        let pending = self.begin_mutation(query_key, patch);
        match commit.await {
            Ok(confirmation) => Ok(pending
                .confirm(confirmation)
                .unwrap_or_else(|| CacheView::empty(query_key))),
            Err(error) => {
                pending.rollback(&error);
                Err(error)
            }
        }
    }

    fn settle(&self, query_key: &str, patch_id: u64, settlement: Settlement) -> Option<CacheView> {
        let (view, event) = {
            let mut state = self.lock_state();
            let pinned = state.is_pinned(query_key);
            let entry = state.entries.get_mut(query_key)?;
            let position = entry.pending.iter().position(|p| p.id == patch_id)?;
            let was_last = position + 1 == entry.pending.len();
            let pending = entry.pending.remove(position);

            match settlement {
                Settlement::Confirm(confirmation) => {
                    let mut confirmed = entry.confirmed.take().unwrap_or_default();
                    confirmation.apply(&mut confirmed);
                    entry.confirmed = Some(confirmed);
                    entry.generation += 1;
                    entry.invalidated = true;
                    entry.recompute();
                    (
                        Some(entry.view(query_key)),
                        CacheEvent::Invalidated {
                            query_key: query_key.to_string(),
                        },
                    )
                }
                Settlement::Rollback(reason) => {
                    if was_last && pending.base_generation == entry.generation {
                        entry.data = pending.rollback_data;
                    } else {
                        entry.recompute();
                    }
                    entry.generation += 1;
                    entry.invalidated = true;

                    let view = if entry.confirmed.is_none() && entry.pending.is_empty() && !pinned
                    {
                        state.entries.remove(query_key);
                        None
                    } else {
                        Some(entry.view(query_key))
                    };
                    (
                        view,
                        CacheEvent::RolledBack {
                            query_key: query_key.to_string(),
                            reason,
                        },
                    )
                }
            }
        };

        if let CacheEvent::RolledBack { reason, .. } = &event {
            log::warn!("Rolled back optimistic patch {patch_id} on {query_key}: {reason}");
        }
        self.emit(event);
        view
    }

    /// Mark a query for refetch.
    pub fn invalidate(&self, query_key: &str) -> bool {
        let found = {
            let mut state = self.lock_state();
            match state.entries.get_mut(query_key) {
                Some(entry) => {
                    entry.invalidated = true;
                    true
                }
                None => false,
            }
        };
        if found {
            self.emit(CacheEvent::Invalidated {
                query_key: query_key.to_string(),
            });
        }
        found
    }

    pub fn is_invalidated(&self, query_key: &str) -> bool {
        self.lock_state()
            .entries
            .get(query_key)
            .is_some_and(|entry| entry.invalidated)
    }

    /// Protect an entry from eviction (used by live subscriptions).
    pub fn retain(&self, query_key: &str) {
        *self
            .lock_state()
            .pins
            .entry(query_key.to_string())
            .or_insert(0) += 1;
    }

    pub fn release(&self, query_key: &str) {
        let mut state = self.lock_state();
        if let Some(count) = state.pins.get_mut(query_key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.pins.remove(query_key);
            }
        }
    }

    /// Evict every entry that is past the staleness window, unpinned and
    /// has no pending mutations. Returns the evicted keys.
    pub fn evict_expired(&self) -> Vec<String> {
        let window = self.inner.config.staleness_window();
        let now = Instant::now();
        let evicted: Vec<String> = {
            let mut state = self.lock_state();
            let expired: Vec<String> = state
                .entries
                .iter()
                .filter(|(key, entry)| {
                    entry.pending.is_empty() && entry.age(now) > window && !state.is_pinned(key)
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                state.entries.remove(key);
            }
            expired
        };
        for key in &evicted {
            log::debug!("Evicted stale cache entry {key}");
            self.emit(CacheEvent::Evicted {
                query_key: key.clone(),
            });
        }
        evicted
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock_state().entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("CacheCoordinator")
            .field("entries", &state.entries.len())
            .field("pinned", &state.pins.len())
            .finish()
    }
}

/// An applied optimistic patch awaiting the server's answer.
#[must_use = "dropping a pending mutation rolls it back"]
pub struct PendingMutation {
    cache: CacheCoordinator,
    query_key: String,
    patch_id: u64,
    settled: bool,
}

impl PendingMutation {
    pub fn query_key(&self) -> &str {
        &self.query_key
    }

    /// Fold the server-confirmed data in and invalidate the query.
    pub fn confirm(mut self, confirmation: Confirmation) -> Option<CacheView> {
        self.settled = true;
        self.cache
            .settle(&self.query_key, self.patch_id, Settlement::Confirm(confirmation))
    }

    /// Undo the patch. Returns `None` if the entry held nothing else and
    /// was removed.
    ///
    /// The returned view's `data` equals what a read before the mutation
    /// returned, but the view itself does not: it is flagged `invalidated`
    /// until the next snapshot for the query arrives.
    pub fn rollback(mut self, error: &SyncError) -> Option<CacheView> {
        self.settled = true;
        self.cache.settle(
            &self.query_key,
            self.patch_id,
            Settlement::Rollback(error.to_string()),
        )
    }
}

impl Drop for PendingMutation {
    fn drop(&mut self) {
        if !self.settled {
            self.cache.settle(
                &self.query_key,
                self.patch_id,
                Settlement::Rollback("mutation abandoned".to_string()),
            );
        }
    }
}

impl fmt::Debug for PendingMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingMutation")
            .field("query_key", &self.query_key)
            .field("patch_id", &self.patch_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use serde_json::json;
    use std::time::Duration;

    fn doc(id: &str, title: &str) -> RemoteDocument {
        RemoteDocument::new(id, json!({ "title": title }))
    }

    fn ids(view: &CacheView) -> Vec<&str> {
        view.data.iter().map(|d| d.id.as_str()).collect()
    }

    fn rejected() -> SyncError {
        SyncError::Rejected(RemoteError::permission_denied("403"))
    }

    #[test]
    fn test_patch_visible_immediately() {
        let cache = CacheCoordinator::new(CacheConfig::for_testing());
        cache.apply_snapshot("prompts", vec![doc("a", "A")]);

        let pending = cache.begin_mutation("prompts", upsert_document(doc("b", "B")));
        let view = cache.read("prompts").unwrap();
        assert_eq!(ids(&view), vec!["a", "b"]);
        assert_eq!(view.pending_mutations, 1);

        pending.confirm(Confirmation::Upsert(vec![doc("b", "B")]));
    }

    #[test]
    fn test_rollback_restores_previous_data() {
        let cache = CacheCoordinator::new(CacheConfig::for_testing());
        let before = cache.apply_snapshot("prompts", vec![doc("a", "A")]);
        assert!(!before.invalidated);

        let pending = cache.begin_mutation("prompts", merge_document("a", json!({ "title": "Z" })));
        assert_eq!(cache.read("prompts").unwrap().data[0].data["title"], "Z");

        // Same documents as before the mutation, but flagged for refetch
        let view = pending.rollback(&rejected()).unwrap();
        assert_eq!(view.data, before.data);
        assert_eq!(view.pending_mutations, 0);
        assert!(view.invalidated);
        assert_ne!(view, before);
        assert!(cache.is_invalidated("prompts"));

        let refreshed = cache.apply_snapshot("prompts", vec![doc("a", "A")]);
        assert!(!refreshed.invalidated);
    }

    #[test]
    fn test_rollback_without_snapshot_removes_entry() {
        let cache = CacheCoordinator::new(CacheConfig::for_testing());
        let pending = cache.begin_mutation("new", upsert_document(doc("x", "X")));
        assert!(cache.read("new").is_some());

        assert!(pending.rollback(&rejected()).is_none());
        assert!(cache.read("new").is_none());
    }

    #[test]
    fn test_confirm_folds_into_confirmed_and_invalidates() {
        let cache = CacheCoordinator::new(CacheConfig::for_testing());
        let mut events = cache.subscribe_events();
        cache.apply_snapshot("prompts", vec![doc("a", "A")]);

        let pending = cache.begin_mutation("prompts", upsert_document(doc("tmp", "New")));
        let view = pending
            .confirm(Confirmation::Upsert(vec![doc("srv-1", "New")]))
            .unwrap();
        // The temporary document disappears with its patch
        assert_eq!(ids(&view), vec!["a", "srv-1"]);
        assert!(view.invalidated);

        let mut saw_invalidated = false;
        while let Ok(event) = events.try_recv() {
            saw_invalidated |= matches!(event, CacheEvent::Invalidated { .. });
        }
        assert!(saw_invalidated);

        let view = cache.apply_snapshot("prompts", vec![doc("a", "A"), doc("srv-1", "New")]);
        assert!(!view.invalidated);
    }

    #[test]
    fn test_rollback_of_middle_patch_keeps_others() {
        let cache = CacheCoordinator::new(CacheConfig::for_testing());
        cache.apply_snapshot("p", vec![doc("a", "A")]);

        let first = cache.begin_mutation("p", upsert_document(doc("b", "B")));
        let second = cache.begin_mutation("p", upsert_document(doc("c", "C")));
        let third = cache.begin_mutation("p", remove_document("a"));

        let view = second.rollback(&rejected()).unwrap();
        assert_eq!(ids(&view), vec!["b"]);
        assert_eq!(view.pending_mutations, 2);

        let view = third.rollback(&rejected()).unwrap();
        assert_eq!(ids(&view), vec!["a", "b"]);

        first.confirm(Confirmation::Upsert(vec![doc("b", "B")]));
        assert_eq!(ids(&cache.read("p").unwrap()), vec!["a", "b"]);
    }

    #[test]
    fn test_snapshot_is_idempotent_and_replays_pending() {
        let cache = CacheCoordinator::new(CacheConfig::for_testing());
        let _pending = cache.begin_mutation("p", upsert_document(doc("local", "L")));

        let server = vec![doc("a", "A"), doc("b", "B")];
        let first = cache.apply_snapshot("p", server.clone());
        let second = cache.apply_snapshot("p", server);
        assert_eq!(first.data, second.data);
        assert_eq!(ids(&second), vec!["a", "b", "local"]);
    }

    #[test]
    fn test_rollback_after_new_snapshot_recomputes() {
        let cache = CacheCoordinator::new(CacheConfig::for_testing());
        cache.apply_snapshot("p", vec![doc("a", "A")]);
        let pending = cache.begin_mutation("p", upsert_document(doc("b", "B")));

        cache.apply_snapshot("p", vec![doc("a", "A2"), doc("c", "C")]);
        let view = pending.rollback(&rejected()).unwrap();
        // Restoring the pre-patch data would lose the newer snapshot
        assert_eq!(ids(&view), vec!["a", "c"]);
        assert_eq!(view.data[0].data["title"], "A2");
    }

    #[test]
    fn test_dropped_mutation_rolls_back() {
        let cache = CacheCoordinator::new(CacheConfig::for_testing());
        cache.apply_snapshot("p", vec![]);
        {
            let _pending = cache.begin_mutation("p", upsert_document(doc("x", "X")));
            assert_eq!(cache.read("p").unwrap().data.len(), 1);
        }
        let view = cache.read("p").unwrap();
        assert!(view.data.is_empty());
        assert_eq!(view.pending_mutations, 0);
    }

    #[tokio::test]
    async fn test_mutate_success_and_failure() {
        let cache = CacheCoordinator::new(CacheConfig::for_testing());
        cache.apply_snapshot("p", vec![doc("a", "A")]);

        let view = cache
            .mutate("p", merge_document("a", json!({ "done": true })), async {
                Ok(Confirmation::Merge {
                    id: "a".into(),
                    fields: json!({ "done": true }),
                })
            })
            .await
            .unwrap();
        assert_eq!(view.data[0].data, json!({ "title": "A", "done": true }));

        let err = cache
            .mutate("p", remove_document("a"), async { Err(rejected()) })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected(_)));
        assert_eq!(ids(&cache.read("p").unwrap()), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_respects_pins_and_pending() {
        let cache = CacheCoordinator::new(CacheConfig::for_testing());
        cache.apply_snapshot("idle", vec![doc("a", "A")]);
        cache.apply_snapshot("pinned", vec![doc("b", "B")]);
        cache.apply_snapshot("busy", vec![doc("c", "C")]);
        cache.retain("pinned");
        let pending = cache.begin_mutation("busy", remove_document("c"));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(cache.evict_expired().is_empty());

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(cache.evict_expired(), vec!["idle".to_string()]);
        assert!(cache.read("pinned").is_some());
        assert!(cache.read("busy").is_some());

        cache.release("pinned");
        assert!(cache.read("pinned").is_none());

        drop(pending);
        assert!(cache.read("busy").is_none());
    }

    #[test]
    fn test_invalidate_unknown_key() {
        let cache = CacheCoordinator::new(CacheConfig::for_testing());
        assert!(!cache.invalidate("nothing"));
        cache.apply_snapshot("p", vec![]);
        assert!(cache.invalidate("p"));
        assert!(cache.is_invalidated("p"));
    }
}
