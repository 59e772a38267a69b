//! In-memory remote document store.
//!
//! Authoritative collections held in memory, with the behaviours the core
//! relies on from a real backend:
//! - idempotency keys: a replayed write returns the first result unchanged
//! - live listeners re-evaluated after every write
//! - scripted failures, lost acknowledgements and latency for tests
//! - a call log so tests can assert exactly what reached the "server"

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{
    ErrorCallback, ListenerRegistration, QueryOptions, RemoteDocument, RemoteDocumentStore,
    SnapshotCallback, PRECONDITION_FIELD,
};
use crate::error::{RemoteError, RemoteErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMethod {
    Create,
    Update,
    Delete,
    Subscribe,
}

/// One call as received by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub method: RemoteMethod,
    pub collection: String,
    pub document_id: Option<String>,
    pub payload: Option<Value>,
    pub idempotency_key: Option<String>,
}

struct Listener {
    collection: String,
    options: QueryOptions,
    on_snapshot: SnapshotCallback,
    on_error: ErrorCallback,
}

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, BTreeMap<String, Value>>,
    /// idempotency key → id returned by the first application
    applied_keys: HashMap<String, Option<String>>,
    listeners: BTreeMap<u64, Listener>,
    next_listener_id: u64,
    next_document_id: u64,
    calls: Vec<RemoteCall>,
    write_failures: VecDeque<RemoteError>,
    subscribe_failures: VecDeque<RemoteError>,
    lost_acks: usize,
    latency: Duration,
    listeners_opened: u64,
    listeners_closed: u64,
}

impl MemoryState {
    fn collection_docs(&self, collection: &str) -> Vec<RemoteDocument> {
        self.collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, data)| RemoteDocument::new(id.clone(), data.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn snapshots_for(&self, collection: &str) -> Vec<(SnapshotCallback, Vec<RemoteDocument>)> {
        let docs = self.collection_docs(collection);
        self.listeners
            .values()
            .filter(|listener| listener.collection == collection)
            .map(|listener| {
                (
                    listener.on_snapshot.clone(),
                    listener.options.apply(docs.clone()),
                )
            })
            .collect()
    }
}

type WriteResult = Result<Option<String>, RemoteError>;

#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        Self::lock_state(&self.state)
    }

    fn lock_state(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
        state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed a document directly (not recorded as a call); listeners are notified.
    pub fn insert(&self, collection: &str, id: &str, data: Value) {
        let notify = {
            let mut state = self.lock();
            state
                .collections
                .entry(collection.to_string())
                .or_default()
                .insert(id.to_string(), data);
            state.snapshots_for(collection)
        };
        for (callback, docs) in notify {
            callback(docs);
        }
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<Value> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id).cloned())
    }

    pub fn documents(&self, collection: &str) -> Vec<RemoteDocument> {
        self.lock().collection_docs(collection)
    }

    /// Every call received, in arrival order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, method: RemoteMethod) -> Vec<RemoteCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.method == method)
            .cloned()
            .collect()
    }

    /// Fail the next `count` write calls with `error`.
    pub fn fail_next_writes(&self, error: RemoteError, count: usize) {
        let mut state = self.lock();
        for _ in 0..count {
            state.write_failures.push_back(error.clone());
        }
    }

    pub fn fail_next_subscribe(&self, error: RemoteError) {
        self.lock().subscribe_failures.push_back(error);
    }

    /// Apply the next `count` writes but report a network failure, as if the
    /// connection dropped before the acknowledgement arrived.
    pub fn drop_next_acks(&self, count: usize) {
        self.lock().lost_acks += count;
    }

    /// Delay every write by `latency` before it is applied.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Deliver `error` to every listener on `collection`.
    pub fn emit_error(&self, collection: &str, error: RemoteError) {
        let callbacks: Vec<ErrorCallback> = self
            .lock()
            .listeners
            .values()
            .filter(|listener| listener.collection == collection)
            .map(|listener| listener.on_error.clone())
            .collect();
        for callback in callbacks {
            callback(error.clone());
        }
    }

    pub fn listeners_opened(&self) -> u64 {
        self.lock().listeners_opened
    }

    pub fn listeners_closed(&self) -> u64 {
        self.lock().listeners_closed
    }

    pub fn active_listeners(&self) -> usize {
        self.lock().listeners.len()
    }

    async fn write(
        &self,
        call: RemoteCall,
        apply: impl FnOnce(&mut MemoryState) -> WriteResult,
    ) -> WriteResult {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let (result, notify) = {
            let mut state = self.lock();
            state.calls.push(call.clone());

            if let Some(error) = state.write_failures.pop_front() {
                return Err(error);
            }

            if let Some(key) = &call.idempotency_key {
                if let Some(previous) = state.applied_keys.get(key) {
                    log::debug!("Idempotent replay of {key} ignored");
                    return Ok(previous.clone());
                }
            }

            let result = apply(&mut *state)?;
            if let Some(key) = call.idempotency_key.clone() {
                state.applied_keys.insert(key, result.clone());
            }

            let notify = state.snapshots_for(&call.collection);
            if state.lost_acks > 0 {
                state.lost_acks -= 1;
                (
                    Err(RemoteError::network("connection dropped before acknowledgement")),
                    notify,
                )
            } else {
                (Ok(result), notify)
            }
        };

        for (callback, docs) in notify {
            callback(docs);
        }
        result
    }
}

#[async_trait]
impl RemoteDocumentStore for MemoryRemoteStore {
    async fn create(
        &self,
        collection: &str,
        payload: Value,
        idempotency_key: &str,
    ) -> Result<String, RemoteError> {
        let call = RemoteCall {
            method: RemoteMethod::Create,
            collection: collection.to_string(),
            document_id: None,
            payload: Some(payload.clone()),
            idempotency_key: Some(idempotency_key.to_string()),
        };
        let owned_collection = collection.to_string();
        let id = self
            .write(call, move |state| {
                state.next_document_id += 1;
                let id = format!("doc-{}", state.next_document_id);
                state
                    .collections
                    .entry(owned_collection)
                    .or_default()
                    .insert(id.clone(), payload);
                Ok(Some(id))
            })
            .await?;
        id.ok_or_else(|| RemoteError::new(RemoteErrorKind::Internal, "create returned no id"))
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        payload: Value,
        idempotency_key: &str,
    ) -> Result<(), RemoteError> {
        let call = RemoteCall {
            method: RemoteMethod::Update,
            collection: collection.to_string(),
            document_id: Some(id.to_string()),
            payload: Some(payload.clone()),
            idempotency_key: Some(idempotency_key.to_string()),
        };
        let owned_collection = collection.to_string();
        let owned_id = id.to_string();
        self.write(call, move |state| {
            let (precondition, payload) = split_precondition(payload);
            let docs = state.collections.entry(owned_collection).or_default();
            if let Some(expected) = precondition {
                let stored = docs.get(&owned_id);
                let holds = expected.iter().all(|(field, value)| {
                    stored.and_then(|doc| doc.get(field)).unwrap_or(&Value::Null) == value
                });
                if !holds {
                    return Err(RemoteError::conflict(
                        format!("precondition failed for {owned_id}"),
                        stored.cloned(),
                    ));
                }
            }
            let current = docs.entry(owned_id).or_insert_with(|| Value::Object(Map::new()));
            merge_fields(current, payload);
            Ok(None)
        })
        .await
        .map(|_| ())
    }

    async fn delete(
        &self,
        collection: &str,
        id: &str,
        idempotency_key: &str,
    ) -> Result<(), RemoteError> {
        let call = RemoteCall {
            method: RemoteMethod::Delete,
            collection: collection.to_string(),
            document_id: Some(id.to_string()),
            payload: None,
            idempotency_key: Some(idempotency_key.to_string()),
        };
        let owned_collection = collection.to_string();
        let owned_id = id.to_string();
        self.write(call, move |state| {
            if let Some(docs) = state.collections.get_mut(&owned_collection) {
                docs.remove(&owned_id);
            }
            Ok(None)
        })
        .await
        .map(|_| ())
    }

    async fn subscribe(
        &self,
        collection: &str,
        options: QueryOptions,
        on_snapshot: SnapshotCallback,
        on_error: ErrorCallback,
    ) -> Result<ListenerRegistration, RemoteError> {
        let (listener_id, initial) = {
            let mut state = self.lock();
            state.calls.push(RemoteCall {
                method: RemoteMethod::Subscribe,
                collection: collection.to_string(),
                document_id: None,
                payload: None,
                idempotency_key: None,
            });
            if let Some(error) = state.subscribe_failures.pop_front() {
                return Err(error);
            }

            let listener_id = state.next_listener_id;
            state.next_listener_id += 1;
            state.listeners_opened += 1;
            let initial = options.apply(state.collection_docs(collection));
            state.listeners.insert(
                listener_id,
                Listener {
                    collection: collection.to_string(),
                    options,
                    on_snapshot: on_snapshot.clone(),
                    on_error,
                },
            );
            (listener_id, initial)
        };

        on_snapshot(initial);

        let state = Arc::downgrade(&self.state);
        Ok(ListenerRegistration::new(move || {
            if let Some(state) = state.upgrade() {
                let mut state = Self::lock_state(&state);
                if state.listeners.remove(&listener_id).is_some() {
                    state.listeners_closed += 1;
                }
            }
        }))
    }
}

fn split_precondition(payload: Value) -> (Option<Map<String, Value>>, Value) {
    match payload {
        Value::Object(mut fields) => {
            let precondition = match fields.remove(PRECONDITION_FIELD) {
                Some(Value::Object(expected)) => Some(expected),
                _ => None,
            };
            (precondition, Value::Object(fields))
        }
        other => (None, other),
    }
}

/// Merge payload fields into the stored value; non-object payloads replace it.
fn merge_fields(target: &mut Value, payload: Value) {
    match (target, payload) {
        (Value::Object(existing), Value::Object(fields)) => {
            for (key, value) in fields {
                set_path(existing, &key, value);
            }
        }
        (target, payload) => *target = payload,
    }
}

/// Set a dotted field path, creating intermediate objects. `null` removes
/// the field.
fn set_path(root: &mut Map<String, Value>, path: &str, value: Value) {
    let Some((head, rest)) = path.split_once('.') else {
        if value.is_null() {
            root.remove(path);
        } else {
            root.insert(path.to_string(), value);
        }
        return;
    };
    let child = root
        .entry(head.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        *child = Value::Object(Map::new());
    }
    if let Value::Object(child) = child {
        set_path(child, rest, value);
    }
}
