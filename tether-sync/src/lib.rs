//! # tether-sync — Client-side data-consistency core
//!
//! Keeps a client working while offline: writes are queued durably and
//! applied optimistically, live queries are deduplicated and reconciled
//! into a cache, and collaborative edits are guarded by document versions.
//!
//! ## Architecture
//!
//! ```text
//!              ┌───────────────────────── SyncCore ─────────────────────────┐
//!  UI write ──►│ CacheCoordinator ◄── apply_snapshot ── SubscriptionManager │◄── snapshots
//!              │  (optimistic patch,                      (one listener      │
//!              │   rollback)                               per query key)    │
//!              │        │                                        ▲           │
//!              │        ▼                                        │           │
//!              │ MutationQueue ────── deliver (idempotent) ──────┼───────────│──► RemoteDocumentStore
//!              │  (durable log,                                  │           │
//!              │   retry/backoff,            ConflictDetector ───┘           │
//!              │   dead letters)              (version OCC, presence)        │
//!              └────────┬───────────────────────────────────────────────────┘
//!                       ▼
//!                KeyValueStore (survives restarts)
//! ```
//!
//! ## Modules
//!
//! - [`queue`] — durable mutation queue, FIFO per document, bounded retry
//! - [`cache`] — optimistic query cache with rollback
//! - [`subscription`] — ref-counted realtime listeners
//! - [`conflict`] — version-based conflict detection and debounced sessions
//! - [`remote`] — remote document store contract and in-memory store
//! - [`storage`] — durable key-value stores (memory, file)
//! - [`connectivity`] — online/offline signal
//! - [`client`] — composition root (`SyncCore`)

pub mod cache;
pub mod client;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod error;
pub mod queue;
pub mod remote;
pub mod storage;
pub mod subscription;

// Re-exports for convenience
pub use cache::{
    merge_document, remove_document, upsert_document, CacheCoordinator, CacheEvent, CacheView,
    Confirmation, PatchFn, PendingMutation,
};
pub use config::{CacheConfig, CollabConfig, QueueConfig, SyncConfig};
pub use conflict::{
    CollaborativeDocument, ConflictDetector, ConflictEvent, EditSession, WriteReceipt,
};
pub use client::{PendingWrite, SyncCore};
pub use connectivity::ConnectivityMonitor;
pub use error::{
    ConflictInfo, KvError, QueueError, RemoteError, RemoteErrorKind, SyncError, SyncResult,
};
pub use queue::{
    DeadLetter, DeadLetterReason, DeliveryOutcome, FlushSummary, MutationQueue, MutationRequest,
    OperationHandle, OperationKind, OperationState, QueueEvent, QueueStats, QueuedOperation,
};
pub use remote::{
    ListenerRegistration, MemoryRemoteStore, QueryOptions, RemoteDocument, RemoteDocumentStore,
};
pub use storage::{FileKvStore, KeyValueStore, MemoryKvStore};
pub use subscription::{
    QuerySpec, SubscriptionHandle, SubscriptionManager, SubscriptionState, SubscriptionUpdate,
    UpdateCallback,
};
