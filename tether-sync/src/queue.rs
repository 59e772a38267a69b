//! Durable mutation queue with bounded, jittered retry.
//!
//! Architecture:
//! ```text
//! enqueue() ──► assign id ──► persist log (KV) ──► ack OperationHandle
//!                              (pending + dead letters, one record)
//!                                   │
//!            online ──► flush() ────┤ one worker per document key
//!                                   ▼
//!                 ┌──────── deliver(op, idempotency_key = op.id) ────────┐
//!                 │ Ok            → Delivered                            │
//!                 │ 4xx           → Rejected        ──► dead-letter list │
//!                 │ 409/412       → Conflict        ──► dead-letter list │
//!                 │ 5xx/timeout   → Retrying (backoff + jitter) ─┐       │
//!                 │                 budget spent → ExhaustedRetries ──►  │
//!                 └──────────────────────────────────────────────┘       │
//! ```
//!
//! Per-operation state machine: `Pending → Retrying → Delivered | DeadLettered`.
//!
//! Guarantees:
//! - the log is written to the durable store before `enqueue` returns
//! - operations sharing a document key are delivered in enqueue order, with
//!   at most one delivery in flight per key
//! - different keys are delivered concurrently
//! - every operation settles exactly once; the issuer observes the outcome
//!   through its [`OperationHandle`], everyone else through [`QueueEvent`]s

use futures_util::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{QueueError, RemoteError, RemoteErrorKind, SyncError};
use crate::remote::RemoteDocumentStore;
use crate::storage::KeyValueStore;

const LOG_FORMAT_VERSION: u32 = 2;
const RECENTLY_DELIVERED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// A write waiting for delivery. This is the persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    /// Unique id, forwarded as the idempotency key
    pub id: String,
    pub kind: OperationKind,
    pub collection_path: String,
    pub document_id: Option<String>,
    pub payload: Value,
    /// Milliseconds since the Unix epoch
    pub enqueued_at: u64,
    /// Delivery attempts so far (never decreases)
    pub attempts: u32,
    /// Attempt count at which the current retry budget started
    #[serde(default)]
    pub attempt_base: u32,
    /// Global enqueue order
    pub sequence: u64,
}

impl QueuedOperation {
    /// Ordering key: operations with the same key are delivered FIFO.
    ///
    /// A create without a document id has no prior identity and only
    /// orders against itself.
    pub fn document_key(&self) -> String {
        match &self.document_id {
            Some(document_id) => format!("{}/{}", self.collection_path, document_id),
            None => format!("{}#{}", self.collection_path, self.id),
        }
    }

    fn budget_used(&self) -> u32 {
        self.attempts.saturating_sub(self.attempt_base)
    }
}

/// Write request handed to [`MutationQueue::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    pub kind: OperationKind,
    pub collection_path: String,
    pub document_id: Option<String>,
    pub payload: Value,
}

impl MutationRequest {
    pub fn create(collection_path: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: OperationKind::Create,
            collection_path: collection_path.into(),
            document_id: None,
            payload,
        }
    }

    pub fn update(
        collection_path: impl Into<String>,
        document_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            kind: OperationKind::Update,
            collection_path: collection_path.into(),
            document_id: Some(document_id.into()),
            payload,
        }
    }

    pub fn delete(collection_path: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Delete,
            collection_path: collection_path.into(),
            document_id: Some(document_id.into()),
            payload: Value::Null,
        }
    }

    fn validate(&self) -> Result<(), QueueError> {
        if self.collection_path.is_empty() {
            return Err(QueueError::InvalidOperation(
                "collection path must not be empty".into(),
            ));
        }
        match (self.kind, &self.document_id) {
            (OperationKind::Update | OperationKind::Delete, None) => Err(
                QueueError::InvalidOperation(format!("{:?} requires a document id", self.kind)),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Retrying,
    Delivered,
    DeadLettered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadLetterReason {
    Rejected,
    Conflict,
    ExhaustedRetries,
}

/// Terminal record of an operation that did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub operation: QueuedOperation,
    pub reason: DeadLetterReason,
    pub error: String,
    pub failed_at: u64,
}

/// How an operation settled.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// `remote_id` is the created id for creates, the target id otherwise
    Delivered { remote_id: Option<String> },
    Rejected(RemoteError),
    Conflict(RemoteError),
    ExhaustedRetries { attempts: u32, last_error: RemoteError },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    pub fn into_result(self, operation_id: &str) -> Result<Option<String>, SyncError> {
        match self {
            DeliveryOutcome::Delivered { remote_id } => Ok(remote_id),
            DeliveryOutcome::Rejected(error) => Err(SyncError::Rejected(error)),
            DeliveryOutcome::Conflict(error) => Err(SyncError::RemoteConflict(error)),
            DeliveryOutcome::ExhaustedRetries {
                attempts,
                last_error,
            } => Err(SyncError::ExhaustedRetries {
                operation_id: operation_id.to_string(),
                attempts,
                last_error,
            }),
        }
    }

    fn dead_letter(&self) -> Option<(DeadLetterReason, String)> {
        match self {
            DeliveryOutcome::Delivered { .. } => None,
            DeliveryOutcome::Rejected(error) => {
                Some((DeadLetterReason::Rejected, error.to_string()))
            }
            DeliveryOutcome::Conflict(error) => {
                Some((DeadLetterReason::Conflict, error.to_string()))
            }
            DeliveryOutcome::ExhaustedRetries { last_error, .. } => {
                Some((DeadLetterReason::ExhaustedRetries, last_error.to_string()))
            }
        }
    }
}

/// Queue activity, broadcast to every observer.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Enqueued {
        id: String,
        document_key: String,
    },
    Delivered {
        id: String,
        remote_id: Option<String>,
    },
    Retrying {
        id: String,
        attempt: u32,
        delay: Duration,
        error: RemoteError,
    },
    DeadLettered {
        id: String,
        reason: DeadLetterReason,
        error: String,
    },
    ConnectivityChanged {
        online: bool,
    },
}

/// Returned by `enqueue`; resolves once the operation settles.
#[must_use = "dropping the handle discards the delivery outcome"]
#[derive(Debug)]
pub struct OperationHandle {
    id: String,
    outcome: oneshot::Receiver<DeliveryOutcome>,
}

impl OperationHandle {
    /// A handle for `id` whose outcome is supplied through the returned
    /// sender instead of by the queue.
    pub(crate) fn relay(id: &str) -> (Self, oneshot::Sender<DeliveryOutcome>) {
        let (sender, outcome) = oneshot::channel();
        (
            Self {
                id: id.to_string(),
                outcome,
            },
            sender,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the terminal outcome.
    pub async fn outcome(self) -> Result<DeliveryOutcome, SyncError> {
        let Self { id, outcome } = self;
        outcome.await.map_err(|_| SyncError::Abandoned(id))
    }

    /// Wait for delivery, mapping non-delivery outcomes to errors.
    pub async fn delivered(self) -> Result<Option<String>, SyncError> {
        let id = self.id.clone();
        self.outcome().await?.into_result(&id)
    }
}

/// Totals reported by [`MutationQueue::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub delivered: usize,
    pub failed: usize,
    /// Operations left pending because connectivity dropped
    pub deferred: usize,
}

impl FlushSummary {
    fn merge(self, other: FlushSummary) -> FlushSummary {
        FlushSummary {
            delivered: self.delivered + other.delivered,
            failed: self.failed + other.failed,
            deferred: self.deferred + other.deferred,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub pending: usize,
}

/// Counters kept outside the state lock.
#[derive(Default)]
struct AtomicQueueStats {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PersistedLogRef<'a> {
    format_version: u32,
    next_sequence: u64,
    pending: &'a [QueuedOperation],
    dead_letters: &'a [DeadLetter],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedLog {
    format_version: u32,
    next_sequence: u64,
    pending: Vec<QueuedOperation>,
    #[serde(default)]
    dead_letters: Vec<DeadLetter>,
}

#[derive(Default)]
struct QueueState {
    /// Ordered by `sequence`
    pending: Vec<QueuedOperation>,
    dead_letters: Vec<DeadLetter>,
    retrying: HashSet<String>,
    in_flight_keys: HashSet<String>,
    waiters: HashMap<String, oneshot::Sender<DeliveryOutcome>>,
    recently_delivered: VecDeque<String>,
    next_sequence: u64,
}

struct QueueInner {
    config: QueueConfig,
    kv: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteDocumentStore>,
    state: Mutex<QueueState>,
    online: AtomicBool,
    events: broadcast::Sender<QueueEvent>,
    stats: AtomicQueueStats,
}

enum Attempt {
    Settled(DeliveryOutcome),
    /// Connectivity dropped while backing off
    Paused,
    /// The operation left the pending log
    Vanished,
}

/// Durable, ordered log of pending writes.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct MutationQueue {
    inner: Arc<QueueInner>,
}

impl MutationQueue {
    /// Open the queue, restoring any operations persisted by a previous run.
    ///
    /// The queue starts offline; delivery resumes once
    /// [`set_online`](Self::set_online) or an attached connectivity signal
    /// reports the network as available.
    pub fn open(
        config: QueueConfig,
        kv: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteDocumentStore>,
    ) -> Result<Self, QueueError> {
        let mut state = QueueState::default();

        if let Some(bytes) = kv.get(&log_key(&config))? {
            let log: PersistedLog = serde_json::from_slice(&bytes)
                .map_err(|e| QueueError::CorruptState(e.to_string()))?;
            if log.format_version != LOG_FORMAT_VERSION {
                return Err(QueueError::CorruptState(format!(
                    "unsupported log format version {}",
                    log.format_version
                )));
            }
            state.pending = log.pending;
            state.pending.sort_by_key(|op| op.sequence);
            let after_last = state.pending.last().map_or(0, |op| op.sequence + 1);
            state.next_sequence = log.next_sequence.max(after_last);
            state.dead_letters = log.dead_letters;
        }

        if !state.pending.is_empty() || !state.dead_letters.is_empty() {
            log::info!(
                "Restored {} pending and {} dead-lettered operations",
                state.pending.len(),
                state.dead_letters.len()
            );
        }

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Ok(Self {
            inner: Arc::new(QueueInner {
                config,
                kv,
                remote,
                state: Mutex::new(state),
                online: AtomicBool::new(false),
                events,
                stats: AtomicQueueStats::default(),
            }),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    // ─── Enqueue ─────────────────────────────────────────────────────

    /// Record a write durably and schedule its delivery.
    ///
    /// Never waits on the network: once this returns `Ok`, the operation
    /// is in the durable store and will survive a restart.
    pub fn enqueue(&self, request: MutationRequest) -> Result<OperationHandle, QueueError> {
        request.validate()?;
        let (tx, rx) = oneshot::channel();

        let operation = {
            let mut state = self.lock_state();
            if state.pending.len() >= self.inner.config.max_pending {
                return Err(QueueError::Full(state.pending.len()));
            }

            let operation = QueuedOperation {
                id: Uuid::new_v4().to_string(),
                kind: request.kind,
                collection_path: request.collection_path,
                document_id: request.document_id,
                payload: request.payload,
                enqueued_at: now_millis(),
                attempts: 0,
                attempt_base: 0,
                sequence: state.next_sequence,
            };
            state.pending.push(operation.clone());
            state.next_sequence += 1;

            if let Err(err) = self.persist_log(&state) {
                state.pending.pop();
                state.next_sequence -= 1;
                log::error!("Enqueue of {} refused: {err}", operation.id);
                return Err(err);
            }

            state.waiters.insert(operation.id.clone(), tx);
            operation
        };

        self.inner.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Enqueued {:?} {} for {}",
            operation.kind,
            operation.id,
            operation.document_key()
        );
        self.emit(QueueEvent::Enqueued {
            id: operation.id.clone(),
            document_key: operation.document_key(),
        });

        if self.is_online() {
            self.spawn_flush();
        }

        Ok(OperationHandle {
            id: operation.id,
            outcome: rx,
        })
    }

    // ─── Delivery ────────────────────────────────────────────────────

    /// Deliver everything currently deliverable.
    ///
    /// Keys already being worked by another flush are skipped; that worker
    /// picks up anything enqueued behind it.
    pub async fn flush(&self) -> FlushSummary {
        if !self.is_online() {
            log::debug!("Flush skipped while offline");
            return FlushSummary::default();
        }

        let keys = self.claim_keys();
        if keys.is_empty() {
            return FlushSummary::default();
        }
        log::debug!("Flushing {} document keys", keys.len());

        join_all(keys.into_iter().map(|key| self.drain_key(key)))
            .await
            .into_iter()
            .fold(FlushSummary::default(), FlushSummary::merge)
    }

    fn spawn_flush(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let queue = self.clone();
                runtime.spawn(async move {
                    queue.flush().await;
                });
            }
            Err(_) => log::debug!("No async runtime; delivery waits for an explicit flush"),
        }
    }

    fn claim_keys(&self) -> Vec<String> {
        let mut state = self.lock_state();
        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        for op in &state.pending {
            let key = op.document_key();
            if !state.in_flight_keys.contains(&key) && seen.insert(key.clone()) {
                keys.push(key);
            }
        }
        for key in &keys {
            state.in_flight_keys.insert(key.clone());
        }
        keys
    }

    /// Deliver the operations of one key, oldest first, until none remain
    /// or the network goes away.
    async fn drain_key(&self, key: String) -> FlushSummary {
        let mut summary = FlushSummary::default();
        loop {
            let next = {
                let mut state = self.lock_state();
                let online = self.is_online();
                let next = if online {
                    state
                        .pending
                        .iter()
                        .find(|op| op.document_key() == key)
                        .map(|op| op.id.clone())
                } else {
                    None
                };
                if next.is_none() {
                    state.in_flight_keys.remove(&key);
                    if !online {
                        summary.deferred +=
                            state.pending.iter().filter(|op| op.document_key() == key).count();
                    }
                }
                next
            };

            let Some(op_id) = next else {
                break;
            };

            match self.deliver(&op_id).await {
                Attempt::Settled(outcome) => {
                    if outcome.is_delivered() {
                        summary.delivered += 1;
                    } else {
                        summary.failed += 1;
                    }
                    self.settle(&op_id, outcome);
                }
                Attempt::Paused | Attempt::Vanished => {}
            }
        }
        summary
    }

    async fn deliver(&self, op_id: &str) -> Attempt {
        let config = &self.inner.config;
        loop {
            let Some(op) = self.begin_attempt(op_id) else {
                return Attempt::Vanished;
            };

            let result = match tokio::time::timeout(config.delivery_timeout(), self.send(&op)).await
            {
                Ok(result) => result,
                Err(_) => Err(RemoteError::timeout(format!(
                    "delivery exceeded {}ms",
                    config.delivery_timeout_ms
                ))),
            };

            let error = match result {
                Ok(remote_id) => return Attempt::Settled(DeliveryOutcome::Delivered { remote_id }),
                Err(error) if error.kind == RemoteErrorKind::Conflict => {
                    return Attempt::Settled(DeliveryOutcome::Conflict(error))
                }
                Err(error) if !error.is_retryable() => {
                    return Attempt::Settled(DeliveryOutcome::Rejected(error))
                }
                Err(error) => error,
            };

            if op.budget_used() >= config.max_attempts {
                return Attempt::Settled(DeliveryOutcome::ExhaustedRetries {
                    attempts: op.attempts,
                    last_error: error,
                });
            }

            let delay = backoff_delay(config, op.budget_used());
            log::warn!(
                "Delivery of {} failed (attempt {}): {error}; retrying in {delay:?}",
                op.id,
                op.attempts
            );
            self.lock_state().retrying.insert(op.id.clone());
            self.inner.stats.retried.fetch_add(1, Ordering::Relaxed);
            self.emit(QueueEvent::Retrying {
                id: op.id.clone(),
                attempt: op.attempts,
                delay,
                error,
            });

            tokio::time::sleep(delay).await;
            if !self.is_online() {
                log::info!("Delivery of {} paused: offline", op.id);
                return Attempt::Paused;
            }
        }
    }

    /// Count the attempt and persist it before going to the network.
    fn begin_attempt(&self, op_id: &str) -> Option<QueuedOperation> {
        let mut state = self.lock_state();
        let op = state.pending.iter_mut().find(|op| op.id == op_id)?;
        op.attempts += 1;
        let op = op.clone();
        if let Err(err) = self.persist_log(&state) {
            log::warn!("Could not persist attempt count for {op_id}: {err}");
        }
        Some(op)
    }

    async fn send(&self, op: &QueuedOperation) -> Result<Option<String>, RemoteError> {
        let remote = &self.inner.remote;
        match (op.kind, op.document_id.as_deref()) {
            (OperationKind::Create, _) => remote
                .create(&op.collection_path, op.payload.clone(), &op.id)
                .await
                .map(Some),
            (OperationKind::Update, Some(document_id)) => remote
                .update(&op.collection_path, document_id, op.payload.clone(), &op.id)
                .await
                .map(|_| Some(document_id.to_string())),
            (OperationKind::Delete, Some(document_id)) => remote
                .delete(&op.collection_path, document_id, &op.id)
                .await
                .map(|_| Some(document_id.to_string())),
            (kind, None) => Err(RemoteError::invalid_argument(format!(
                "{kind:?} without a document id"
            ))),
        }
    }

    /// Remove a settled operation from the log and notify its issuer.
    fn settle(&self, op_id: &str, outcome: DeliveryOutcome) {
        let waiter = {
            let mut state = self.lock_state();
            let Some(position) = state.pending.iter().position(|op| op.id == op_id) else {
                return;
            };
            let operation = state.pending.remove(position);
            state.retrying.remove(op_id);

            match outcome.dead_letter() {
                Some((reason, error)) => {
                    state.dead_letters.push(DeadLetter {
                        operation,
                        reason,
                        error,
                        failed_at: now_millis(),
                    });
                }
                None => {
                    if state.recently_delivered.len() >= RECENTLY_DELIVERED_CAPACITY {
                        state.recently_delivered.pop_front();
                    }
                    state.recently_delivered.push_back(op_id.to_string());
                }
            }

            // Removal and dead letter land in the same record, so a crash
            // leaves the operation in exactly one of the two lists
            if let Err(err) = self.persist_log(&state) {
                log::error!(
                    "Could not persist settlement of {op_id}: {err}; it will be replayed idempotently"
                );
            }
            state.waiters.remove(op_id)
        };

        match &outcome {
            DeliveryOutcome::Delivered { remote_id } => {
                self.inner.stats.delivered.fetch_add(1, Ordering::Relaxed);
                log::debug!("Delivered {op_id}");
                self.emit(QueueEvent::Delivered {
                    id: op_id.to_string(),
                    remote_id: remote_id.clone(),
                });
            }
            other => {
                if let Some((reason, error)) = other.dead_letter() {
                    self.inner.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    log::error!("Operation {op_id} dead-lettered ({reason:?}): {error}");
                    self.emit(QueueEvent::DeadLettered {
                        id: op_id.to_string(),
                        reason,
                        error,
                    });
                }
            }
        }

        if let Some(waiter) = waiter {
            let _ = waiter.send(outcome);
        }
    }

    // ─── Persistence ─────────────────────────────────────────────────

    /// Write pending operations and dead letters as one record.
    fn persist_log(&self, state: &QueueState) -> Result<(), QueueError> {
        let log = PersistedLogRef {
            format_version: LOG_FORMAT_VERSION,
            next_sequence: state.next_sequence,
            pending: &state.pending,
            dead_letters: &state.dead_letters,
        };
        let bytes = serde_json::to_vec(&log)
            .map_err(|e| QueueError::CorruptState(e.to_string()))?;
        self.inner.kv.set(&log_key(&self.inner.config), &bytes)?;
        Ok(())
    }

    // ─── Dead letters ────────────────────────────────────────────────

    /// Move a dead-lettered operation back to the tail of the log with a
    /// fresh retry budget. The operation keeps its id, so a write that had
    /// already been applied stays idempotent.
    pub fn retry_dead_letter(&self, op_id: &str) -> Result<OperationHandle, QueueError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock_state();
            let position = state
                .dead_letters
                .iter()
                .position(|letter| letter.operation.id == op_id)
                .ok_or_else(|| QueueError::UnknownOperation(op_id.to_string()))?;
            if state.pending.len() >= self.inner.config.max_pending {
                return Err(QueueError::Full(state.pending.len()));
            }

            let letter = state.dead_letters.remove(position);
            let mut operation = letter.operation.clone();
            operation.attempt_base = operation.attempts;
            operation.sequence = state.next_sequence;
            state.next_sequence += 1;
            state.pending.push(operation);

            if let Err(err) = self.persist_log(&state) {
                state.pending.pop();
                state.next_sequence -= 1;
                state.dead_letters.insert(position, letter);
                return Err(err);
            }
            state.waiters.insert(op_id.to_string(), tx);
        }

        log::info!("Requeued dead letter {op_id}");
        if self.is_online() {
            self.spawn_flush();
        }
        Ok(OperationHandle {
            id: op_id.to_string(),
            outcome: rx,
        })
    }

    /// Drop a dead letter for good.
    pub fn discard_dead_letter(&self, op_id: &str) -> Result<DeadLetter, QueueError> {
        let mut state = self.lock_state();
        let position = state
            .dead_letters
            .iter()
            .position(|letter| letter.operation.id == op_id)
            .ok_or_else(|| QueueError::UnknownOperation(op_id.to_string()))?;
        let letter = state.dead_letters.remove(position);
        if let Err(err) = self.persist_log(&state) {
            state.dead_letters.insert(position, letter);
            return Err(err);
        }
        log::info!("Discarded dead letter {op_id}");
        Ok(letter)
    }

    // ─── Connectivity ────────────────────────────────────────────────

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Record connectivity; an offline → online transition starts a flush.
    pub fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        if was_online == online {
            return;
        }
        log::info!("Mutation queue is now {}", if online { "online" } else { "offline" });
        self.emit(QueueEvent::ConnectivityChanged { online });
        if online {
            self.spawn_flush();
        }
    }

    /// Follow a connectivity signal until it closes.
    pub fn attach_connectivity(&self, mut signal: watch::Receiver<bool>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let online = *signal.borrow_and_update();
            queue.set_online(online);
            while signal.changed().await.is_ok() {
                let online = *signal.borrow_and_update();
                queue.set_online(online);
            }
        })
    }

    // ─── Introspection ───────────────────────────────────────────────

    pub fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the pending log, oldest first.
    pub fn pending(&self) -> Vec<QueuedOperation> {
        self.lock_state().pending.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.lock_state().pending.len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock_state().dead_letters.clone()
    }

    pub fn operation_state(&self, op_id: &str) -> Option<OperationState> {
        let state = self.lock_state();
        if state.pending.iter().any(|op| op.id == op_id) {
            return Some(if state.retrying.contains(op_id) {
                OperationState::Retrying
            } else {
                OperationState::Pending
            });
        }
        if state.dead_letters.iter().any(|letter| letter.operation.id == op_id) {
            return Some(OperationState::DeadLettered);
        }
        if state.recently_delivered.iter().any(|id| id == op_id) {
            return Some(OperationState::Delivered);
        }
        None
    }

    pub fn stats(&self) -> QueueStats {
        let stats = &self.inner.stats;
        QueueStats {
            enqueued: stats.enqueued.load(Ordering::Relaxed),
            delivered: stats.delivered.load(Ordering::Relaxed),
            retried: stats.retried.load(Ordering::Relaxed),
            dead_lettered: stats.dead_lettered.load(Ordering::Relaxed),
            pending: self.pending_len(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }
}

fn log_key(config: &QueueConfig) -> String {
    format!("{}/log", config.storage_prefix)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Exponential backoff for the given 1-based attempt, capped at
/// `max_delay`, with the configured fraction randomized.
pub fn backoff_delay(config: &QueueConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let capped = config
        .base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(config.max_delay_ms);
    if config.jitter <= 0.0 {
        return Duration::from_millis(capped);
    }

    let span = capped as f64 * config.jitter;
    let sample: f64 = rand::thread_rng().gen_range(0.0..=1.0);
    Duration::from_millis((capped as f64 - span + span * sample).round() as u64)
}
