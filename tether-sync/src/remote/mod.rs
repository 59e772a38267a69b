//! Boundary contract for the remote document store.
//!
//! The remote store is authoritative. The core only needs four calls:
//!
//! ```text
//! create(collection, payload, idempotency_key)      -> id
//! update(collection, id, payload, idempotency_key)  -> ()
//! delete(collection, id, idempotency_key)           -> ()
//! subscribe(collection, QueryOptions, on_snapshot, on_error) -> ListenerRegistration
//! ```
//!
//! Every write carries an idempotency key (the queue's operation id), so a
//! replay of an already-applied write must be a no-op on the server.

pub mod memory;

pub use memory::{MemoryRemoteStore, RemoteCall, RemoteMethod};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::error::RemoteError;

/// Pseudo field that addresses the document id in filters and ordering.
pub const DOCUMENT_ID_FIELD: &str = "__name__";

/// Update payload entry holding the fields the stored document must match.
pub const PRECONDITION_FIELD: &str = "__precondition";

/// A document as delivered by a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub id: String,
    pub data: Value,
}

impl RemoteDocument {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Look up a dotted field path (`"meta.title"`), or the document id for
    /// [`DOCUMENT_ID_FIELD`].
    pub fn field(&self, path: &str) -> Option<Cow<'_, Value>> {
        if path == DOCUMENT_ID_FIELD {
            return Some(Cow::Owned(Value::String(self.id.clone())));
        }
        let mut current = &self.data;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(Cow::Borrowed(current))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: OrderDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    /// Field equals the value
    Equal,
    /// Field is an array containing the value
    ArrayContains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn matches(&self, doc: &RemoteDocument) -> bool {
        let Some(actual) = doc.field(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Equal => *actual == self.value,
            FilterOp::ArrayContains => actual
                .as_array()
                .is_some_and(|items| items.contains(&self.value)),
        }
    }
}

/// Query shape for a subscription: ordering, limit, cursor, filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    /// Pagination cursor: results start after the document with this id
    pub start_after: Option<String>,
    pub filters: Vec<Filter>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: OrderDirection) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, document_id: impl Into<String>) -> Self {
        self.start_after = Some(document_id.into());
        self
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op: FilterOp::Equal,
            value,
        });
        self
    }

    pub fn where_contains(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op: FilterOp::ArrayContains,
            value,
        });
        self
    }

    pub fn matches(&self, doc: &RemoteDocument) -> bool {
        self.filters.iter().all(|filter| filter.matches(doc))
    }

    /// Evaluate the query over a full collection.
    ///
    /// Without an explicit ordering, results are ordered by document id.
    pub fn apply(&self, docs: impl IntoIterator<Item = RemoteDocument>) -> Vec<RemoteDocument> {
        let mut results: Vec<RemoteDocument> =
            docs.into_iter().filter(|doc| self.matches(doc)).collect();

        match &self.order_by {
            Some(order) => results.sort_by(|a, b| {
                let ordering = compare_values(
                    a.field(&order.field).as_deref(),
                    b.field(&order.field).as_deref(),
                )
                .then_with(|| a.id.cmp(&b.id));
                match order.direction {
                    OrderDirection::Ascending => ordering,
                    OrderDirection::Descending => ordering.reverse(),
                }
            }),
            None => results.sort_by(|a, b| a.id.cmp(&b.id)),
        }

        if let Some(cursor) = &self.start_after {
            if let Some(position) = results.iter().position(|doc| &doc.id == cursor) {
                results.drain(..=position);
            }
        }

        if let Some(limit) = self.limit {
            results.truncate(limit);
        }
        results
    }
}

/// Total order over JSON values: missing/null < bool < number < string <
/// array < object.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Receives a full query result every time it changes.
pub type SnapshotCallback = Arc<dyn Fn(Vec<RemoteDocument>) + Send + Sync>;

/// Receives listener failures (e.g. permission revoked).
pub type ErrorCallback = Arc<dyn Fn(RemoteError) + Send + Sync>;

/// Handle to a live remote listener.
///
/// Teardown is explicit: call [`remove`](Self::remove). Dropping the
/// registration leaves the listener running.
#[must_use = "a listener registration must be removed to stop the listener"]
pub struct ListenerRegistration {
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerRegistration {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    /// Registration with nothing to tear down.
    pub fn noop() -> Self {
        Self { teardown: None }
    }

    /// Stop the underlying listener.
    pub fn remove(mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("live", &self.teardown.is_some())
            .finish()
    }
}

/// Authoritative remote document store.
///
/// `update` merges fields into the stored document, creating it when
/// absent. A dotted key such as `"collaborators.alice"` addresses a nested
/// field and a `null` value removes it. When the payload carries an object
/// under [`PRECONDITION_FIELD`], each of its entries must equal the stored
/// field (a missing field compares as `null`); otherwise nothing is written
/// and the call fails with [`RemoteErrorKind::Conflict`] carrying the stored
/// document. The precondition itself is never stored.
///
/// `delete` of a missing document succeeds.
///
/// [`RemoteErrorKind::Conflict`]: crate::error::RemoteErrorKind::Conflict
#[async_trait]
pub trait RemoteDocumentStore: Send + Sync {
    async fn create(
        &self,
        collection: &str,
        payload: Value,
        idempotency_key: &str,
    ) -> Result<String, RemoteError>;

    async fn update(
        &self,
        collection: &str,
        id: &str,
        payload: Value,
        idempotency_key: &str,
    ) -> Result<(), RemoteError>;

    async fn delete(
        &self,
        collection: &str,
        id: &str,
        idempotency_key: &str,
    ) -> Result<(), RemoteError>;

    async fn subscribe(
        &self,
        collection: &str,
        options: QueryOptions,
        on_snapshot: SnapshotCallback,
        on_error: ErrorCallback,
    ) -> Result<ListenerRegistration, RemoteError>;
}
