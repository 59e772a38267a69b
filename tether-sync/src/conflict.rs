//! Version-based optimistic concurrency for collaborative documents.
//!
//! ## Architecture
//!
//! ```text
//! EditSession::edit() ──(debounce)──┐
//!                                   ▼
//! propose_write(doc, expected_v) ── expected_v == known_v ? ──no──► ConflictEvent::Conflict
//!                                   │ yes                           (stale + server content)
//!                                   ▼
//!                    known_v += 1, enqueue Update {content, version, lastModifiedBy,
//!                                                 revision, __precondition}
//!                                   │
//!                    server refuses precondition ──► revert, ConflictEvent::Conflict
//!
//! watch_document() ─► subscription ─► observe_server_document() ─► known_v = pushed_v
//! join()/leave()   ─► collaborators.<user> (version untouched, never conflicts)
//! ```
//!
//! The version check runs twice: locally against the known version, and on
//! the server, where the update only applies if the stored version and
//! revision are still the ones the write was based on. A client that wrote
//! while offline therefore cannot overwrite a newer server copy when it
//! reconnects.
//!
//! The server is authoritative: a pushed document replaces the known state
//! whenever its version is at least the known one. There is no automatic
//! merge; a rejected writer gets both contents back and decides.
//!
//! Reference: Kung & Robinson, "On Optimistic Methods for Concurrency Control" (1981)

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::CollabConfig;
use crate::error::{ConflictInfo, QueueError, SyncError};
use crate::queue::{DeliveryOutcome, MutationQueue, MutationRequest, OperationHandle};
use crate::remote::{QueryOptions, RemoteDocument, DOCUMENT_ID_FIELD, PRECONDITION_FIELD};
use crate::subscription::{
    QuerySpec, SubscriptionHandle, SubscriptionManager, SubscriptionUpdate, UpdateCallback,
};

// ───────────────────────────────────────────────────────────────────
// Document model
// ───────────────────────────────────────────────────────────────────

/// Locally known state of a collaboratively edited document.
#[derive(Debug, Clone, PartialEq)]
pub struct CollaborativeDocument {
    pub id: String,
    pub content: Value,
    /// Increases by exactly one per accepted write
    pub version: u64,
    pub last_modified_by: Option<String>,
    /// Token of the write that produced `version`; `None` for documents
    /// written outside the detector
    pub revision: Option<String>,
    pub collaborators: BTreeSet<String>,
}

impl CollaborativeDocument {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            content: Value::Null,
            version: 0,
            last_modified_by: None,
            revision: None,
            collaborators: BTreeSet::new(),
        }
    }

    /// Take the server's copy. Returns the new collaborator list when the
    /// stored document carries one that differs from the known set.
    fn adopt(&mut self, stored: StoredDocument) -> Option<Vec<String>> {
        self.version = stored.version;
        self.content = stored.content;
        self.last_modified_by = stored.last_modified_by;
        self.revision = stored.revision;

        let collaborators: BTreeSet<String> = stored
            .collaborators?
            .into_iter()
            .filter(|(_, present)| present.as_bool().unwrap_or(false))
            .map(|(user, _)| user)
            .collect();
        if collaborators == self.collaborators {
            return None;
        }
        self.collaborators = collaborators;
        Some(self.collaborators.iter().cloned().collect())
    }
}

/// Stored shape of a collaborative document in the remote collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredDocument {
    #[serde(default)]
    content: Value,
    version: u64,
    #[serde(default)]
    last_modified_by: Option<String>,
    #[serde(default)]
    revision: Option<String>,
    /// `user id -> true` for each present collaborator
    #[serde(default)]
    collaborators: Option<BTreeMap<String, Value>>,
}

/// An accepted write whose delivery is still being watched.
struct InFlightWrite {
    doc_id: String,
    expected_version: u64,
    version: u64,
    revision: String,
    content: Value,
    previous: CollaborativeDocument,
}

/// An accepted write on its way to the server.
#[derive(Debug)]
pub struct WriteReceipt {
    pub doc_id: String,
    /// Version the write produced
    pub version: u64,
    pub operation: OperationHandle,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConflictEvent {
    Accepted {
        doc_id: String,
        version: u64,
        author: String,
    },
    /// Refused locally, or by the server when the write was delivered
    Conflict(Box<ConflictInfo>),
    PresenceChanged {
        doc_id: String,
        collaborators: Vec<String>,
    },
    /// A session write could not be queued, or a queued write was refused
    WriteFailed {
        doc_id: String,
        error: String,
    },
}

// ───────────────────────────────────────────────────────────────────
// Detector
// ───────────────────────────────────────────────────────────────────

struct DetectorInner {
    config: CollabConfig,
    queue: MutationQueue,
    subscriptions: SubscriptionManager,
    documents: Mutex<HashMap<String, CollaborativeDocument>>,
    events: broadcast::Sender<ConflictEvent>,
}

/// Accepts or rejects collaborative writes by version.
#[derive(Clone)]
pub struct ConflictDetector {
    inner: Arc<DetectorInner>,
}

impl ConflictDetector {
    pub fn new(
        config: CollabConfig,
        queue: MutationQueue,
        subscriptions: SubscriptionManager,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(DetectorInner {
                config,
                queue,
                subscriptions,
                documents: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    fn lock_documents(&self) -> MutexGuard<'_, HashMap<String, CollaborativeDocument>> {
        self.inner
            .documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: ConflictEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConflictEvent> {
        self.inner.events.subscribe()
    }

    pub fn collection(&self) -> &str {
        &self.inner.config.collection
    }

    /// Accept `content` iff `expected_version` is the known version, then
    /// bump the version and queue the write.
    ///
    /// The queued update only applies if the server still holds the version
    /// and revision it was based on. When the receipt's operation comes back
    /// refused, the optimistic state is reverted to the server's copy and a
    /// [`ConflictEvent::Conflict`] (or `WriteFailed`) is emitted before the
    /// outcome reaches the caller. That watch needs a tokio runtime; without
    /// one the next server push corrects the known state instead.
    pub fn propose_write(
        &self,
        doc_id: &str,
        expected_version: u64,
        content: Value,
        author: &str,
    ) -> Result<WriteReceipt, SyncError> {
        let mut documents = self.lock_documents();
        let doc = documents
            .entry(doc_id.to_string())
            .or_insert_with(|| CollaborativeDocument::new(doc_id));

        if doc.version != expected_version {
            let info = ConflictInfo {
                doc_id: doc_id.to_string(),
                expected_version,
                server_version: doc.version,
                local_content: content,
                server_content: doc.content.clone(),
                server_modified_by: doc.last_modified_by.clone(),
            };
            drop(documents);
            log::warn!(
                "Conflict on {doc_id}: {author} expected v{expected_version}, known v{}",
                info.server_version
            );
            self.emit(ConflictEvent::Conflict(Box::new(info.clone())));
            return Err(SyncError::Conflict(Box::new(info)));
        }

        let previous = doc.clone();
        let revision = Uuid::new_v4().to_string();
        doc.version += 1;
        doc.content = content;
        doc.last_modified_by = Some(author.to_string());
        doc.revision = Some(revision.clone());
        let version = doc.version;

        let based_on = if expected_version == 0 {
            Value::Null
        } else {
            json!(expected_version)
        };
        let mut payload = json!({
            "content": doc.content,
            "version": version,
            "lastModifiedBy": author,
            "revision": revision,
        });
        payload[PRECONDITION_FIELD] = json!({
            "version": based_on,
            "revision": previous.revision,
        });
        let request = MutationRequest::update(self.inner.config.collection.clone(), doc_id, payload);
        let operation = match self.inner.queue.enqueue(request) {
            Ok(operation) => operation,
            Err(err) => {
                *doc = previous;
                return Err(err.into());
            }
        };
        let write = InFlightWrite {
            doc_id: doc_id.to_string(),
            expected_version,
            version,
            revision,
            content: doc.content.clone(),
            previous,
        };
        drop(documents);
        let operation = self.watch_delivery(write, operation);

        log::debug!("Accepted write on {doc_id} by {author} (v{version})");
        self.emit(ConflictEvent::Accepted {
            doc_id: doc_id.to_string(),
            version,
            author: author.to_string(),
        });
        Ok(WriteReceipt {
            doc_id: doc_id.to_string(),
            version,
            operation,
        })
    }

    /// Apply a server push. Returns `true` if the known state changed.
    pub fn observe_server_document(&self, doc: &RemoteDocument) -> bool {
        let stored: StoredDocument = match serde_json::from_value(doc.data.clone()) {
            Ok(stored) => stored,
            Err(err) => {
                log::debug!("Ignoring non-collaborative document {}: {err}", doc.id);
                return false;
            }
        };

        let presence = {
            let mut documents = self.lock_documents();
            let known = documents
                .entry(doc.id.clone())
                .or_insert_with(|| CollaborativeDocument::new(&doc.id));
            if stored.version < known.version {
                log::trace!(
                    "Ignoring stale push of {} (v{} < v{})",
                    doc.id,
                    stored.version,
                    known.version
                );
                return false;
            }

            known.adopt(stored)
        };

        if let Some(collaborators) = presence {
            self.emit(ConflictEvent::PresenceChanged {
                doc_id: doc.id.clone(),
                collaborators,
            });
        }
        true
    }

    /// Reconcile the known state with the outcome once the queue settles
    /// `operation`, then pass the outcome on through the returned handle.
    fn watch_delivery(&self, write: InFlightWrite, operation: OperationHandle) -> OperationHandle {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return operation;
        };
        let (relayed, forward) = OperationHandle::relay(operation.id());
        let detector: Weak<DetectorInner> = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            // A dropped sender surfaces as `Abandoned` on the relayed handle
            let Ok(outcome) = operation.outcome().await else {
                return;
            };
            if let Some(inner) = detector.upgrade() {
                ConflictDetector { inner }.settle_write(&write, &outcome);
            }
            let _ = forward.send(outcome);
        });
        relayed
    }

    fn settle_write(&self, write: &InFlightWrite, outcome: &DeliveryOutcome) {
        let error = match outcome {
            DeliveryOutcome::Delivered { .. } => return,
            DeliveryOutcome::Rejected(error) | DeliveryOutcome::Conflict(error) => error,
            DeliveryOutcome::ExhaustedRetries { last_error, .. } => last_error,
        };
        let server = error
            .server_document
            .clone()
            .and_then(|doc| serde_json::from_value::<StoredDocument>(doc).ok());

        let (info, presence) = {
            let mut documents = self.lock_documents();
            let doc = documents
                .entry(write.doc_id.clone())
                .or_insert_with(|| CollaborativeDocument::new(&write.doc_id));
            // Undo only while this write is still the newest local one
            if doc.revision.as_deref() == Some(write.revision.as_str()) {
                doc.version = write.previous.version;
                doc.content = write.previous.content.clone();
                doc.last_modified_by = write.previous.last_modified_by.clone();
                doc.revision = write.previous.revision.clone();
            }
            let mut info = ConflictInfo {
                doc_id: write.doc_id.clone(),
                expected_version: write.expected_version,
                server_version: doc.version,
                local_content: write.content.clone(),
                server_content: doc.content.clone(),
                server_modified_by: doc.last_modified_by.clone(),
            };
            let presence = match server {
                Some(stored) => {
                    info.server_version = stored.version;
                    info.server_content = stored.content.clone();
                    info.server_modified_by = stored.last_modified_by.clone();
                    if stored.version >= doc.version {
                        doc.adopt(stored)
                    } else {
                        None
                    }
                }
                None => None,
            };
            (info, presence)
        };

        if let Some(collaborators) = presence {
            self.emit(ConflictEvent::PresenceChanged {
                doc_id: write.doc_id.clone(),
                collaborators,
            });
        }
        if matches!(outcome, DeliveryOutcome::Conflict(_)) {
            log::warn!(
                "Server refused v{} of {}: expected v{}, server has v{}",
                write.version,
                write.doc_id,
                write.expected_version,
                info.server_version
            );
            self.emit(ConflictEvent::Conflict(Box::new(info)));
        } else {
            log::error!("Write v{} of {} failed: {error}", write.version, write.doc_id);
            self.emit(ConflictEvent::WriteFailed {
                doc_id: write.doc_id.clone(),
                error: error.to_string(),
            });
        }
    }

    pub fn observe_remote(&self, docs: &[RemoteDocument]) {
        for doc in docs {
            self.observe_server_document(doc);
        }
    }

    /// Follow the server copy of `doc_id` so its version stays current.
    pub async fn watch_document(&self, doc_id: &str) -> Result<SubscriptionHandle, SyncError> {
        let collection = self.inner.config.collection.clone();
        let query_key = format!("collab:{collection}/{doc_id}");
        let spec = QuerySpec::new(collection)
            .with_options(QueryOptions::new().where_eq(DOCUMENT_ID_FIELD, json!(doc_id)));

        let detector: Weak<DetectorInner> = Arc::downgrade(&self.inner);
        let watched = doc_id.to_string();
        let on_update: UpdateCallback = Arc::new(move |update| {
            let Some(inner) = detector.upgrade() else {
                return;
            };
            match update {
                SubscriptionUpdate::Snapshot(view) => ConflictDetector { inner }.observe_remote(&view.data),
                SubscriptionUpdate::Error(error) => {
                    log::warn!("Watch on {watched} failed: {error}")
                }
            }
        });

        self.inner
            .subscriptions
            .subscribe(&query_key, spec, on_update)
            .await
    }

    pub fn unwatch(&self, handle: SubscriptionHandle) -> bool {
        self.inner.subscriptions.unsubscribe(handle)
    }

    // ─── Presence ────────────────────────────────────────────────────

    /// Add `user_id` to the document's collaborators.
    ///
    /// Only this user's entry is written, so concurrent joins from other
    /// clients are kept. User ids may not contain `.`.
    pub fn join(&self, doc_id: &str, user_id: &str) -> Result<Vec<String>, SyncError> {
        self.update_presence(doc_id, user_id, true)
    }

    pub fn leave(&self, doc_id: &str, user_id: &str) -> Result<Vec<String>, SyncError> {
        self.update_presence(doc_id, user_id, false)
    }

    fn update_presence(
        &self,
        doc_id: &str,
        user_id: &str,
        joined: bool,
    ) -> Result<Vec<String>, SyncError> {
        if user_id.is_empty() || user_id.contains('.') {
            return Err(QueueError::InvalidOperation(format!(
                "collaborator id '{user_id}' must be non-empty and free of '.'"
            ))
            .into());
        }
        let collaborators = {
            let mut documents = self.lock_documents();
            let doc = documents
                .entry(doc_id.to_string())
                .or_insert_with(|| CollaborativeDocument::new(doc_id));
            let changed = if joined {
                doc.collaborators.insert(user_id.to_string())
            } else {
                doc.collaborators.remove(user_id)
            };
            let collaborators: Vec<String> = doc.collaborators.iter().cloned().collect();
            if !changed {
                return Ok(collaborators);
            }

            let mut entry = json!({});
            entry[format!("collaborators.{user_id}")] = if joined { json!(true) } else { Value::Null };
            let request =
                MutationRequest::update(self.inner.config.collection.clone(), doc_id, entry);
            if let Err(err) = self.inner.queue.enqueue(request) {
                if joined {
                    doc.collaborators.remove(user_id);
                } else {
                    doc.collaborators.insert(user_id.to_string());
                }
                return Err(err.into());
            }
            collaborators
        };

        log::debug!(
            "{user_id} {} {doc_id}",
            if joined { "joined" } else { "left" }
        );
        self.emit(ConflictEvent::PresenceChanged {
            doc_id: doc_id.to_string(),
            collaborators: collaborators.clone(),
        });
        Ok(collaborators)
    }

    // ─── Introspection ───────────────────────────────────────────────

    /// Known version; 0 for a document never seen.
    pub fn current_version(&self, doc_id: &str) -> u64 {
        self.lock_documents()
            .get(doc_id)
            .map_or(0, |doc| doc.version)
    }

    pub fn document(&self, doc_id: &str) -> Option<CollaborativeDocument> {
        self.lock_documents().get(doc_id).cloned()
    }

    pub fn collaborators(&self, doc_id: &str) -> Vec<String> {
        self.lock_documents()
            .get(doc_id)
            .map(|doc| doc.collaborators.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Open a debounced editing session for `author` on `doc_id`.
    pub fn edit_session(&self, doc_id: &str, author: &str) -> EditSession {
        EditSession {
            inner: Arc::new(SessionInner {
                detector: self.clone(),
                doc_id: doc_id.to_string(),
                author: author.to_string(),
                debounce: self.inner.config.debounce(),
                state: Mutex::new(SessionState::default()),
            }),
        }
    }
}

impl fmt::Debug for ConflictDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictDetector")
            .field("collection", &self.inner.config.collection)
            .field("documents", &self.lock_documents().len())
            .finish()
    }
}

// ───────────────────────────────────────────────────────────────────
// Debounced edit session
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SessionState {
    draft: Option<Value>,
    timer: Option<JoinHandle<()>>,
}

struct SessionInner {
    detector: ConflictDetector,
    doc_id: String,
    author: String,
    debounce: Duration,
    state: Mutex<SessionState>,
}

impl SessionInner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Propose the latest draft against the version known right now.
    fn fire(&self) -> Option<Result<WriteReceipt, SyncError>> {
        let draft = {
            let mut state = self.lock_state();
            state.timer = None;
            state.draft.take()?
        };

        let version = self.detector.current_version(&self.doc_id);
        let result = self
            .detector
            .propose_write(&self.doc_id, version, draft, &self.author);
        if let Err(err) = &result {
            if err.conflict().is_none() {
                log::error!("Session write on {} failed: {err}", self.doc_id);
                self.detector.emit(ConflictEvent::WriteFailed {
                    doc_id: self.doc_id.clone(),
                    error: err.to_string(),
                });
            }
        }
        Some(result)
    }
}

/// One user's debounced edits to one document.
///
/// Each [`edit`](Self::edit) restarts the debounce timer; when it fires
/// the latest draft is proposed with the version known at that moment.
/// Outcomes are reported on the detector's event stream. Dropping the
/// session discards an unflushed draft.
pub struct EditSession {
    inner: Arc<SessionInner>,
}

impl EditSession {
    pub fn doc_id(&self) -> &str {
        &self.inner.doc_id
    }

    /// Record a new draft and restart the debounce timer.
    ///
    /// Must be called within a tokio runtime.
    pub fn edit(&self, content: Value) {
        let session: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let debounce = self.inner.debounce;

        let mut state = self.inner.lock_state();
        state.draft = Some(content);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(session) = session.upgrade() {
                session.fire();
            }
        }));
    }

    /// Propose the pending draft immediately, if there is one.
    pub fn flush_now(&self) -> Option<Result<WriteReceipt, SyncError>> {
        if let Some(timer) = self.inner.lock_state().timer.take() {
            timer.abort();
        }
        self.inner.fire()
    }

    pub fn pending_draft(&self) -> Option<Value> {
        self.inner.lock_state().draft.clone()
    }
}

impl Drop for EditSession {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.lock_state().timer.take() {
            timer.abort();
        }
    }
}

impl fmt::Debug for EditSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EditSession")
            .field("doc_id", &self.inner.doc_id)
            .field("author", &self.inner.author)
            .finish()
    }
}
