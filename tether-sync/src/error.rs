//! Error taxonomy for the sync core.
//!
//! Every layer has its own `thiserror` enum; [`SyncError`] is the
//! caller-facing type that the public entry points return.
//!
//! ```text
//! RemoteError ──classify──► Transient | Rejected | RemoteConflict
//! KvError ─────────────────► QueueError::Persistence ──► SyncError::Queue
//! version mismatch ────────► SyncError::Conflict(ConflictInfo)
//! retry budget spent ──────► SyncError::ExhaustedRetries
//! ```

use serde_json::Value;
use thiserror::Error;

/// Result alias used by the public API.
pub type SyncResult<T> = Result<T, SyncError>;

/// Durable key-value store errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum KvError {
    #[error("KV I/O error on '{key}': {message}")]
    Io { key: String, message: String },

    #[error("KV record for '{0}' is corrupt")]
    Corrupt(String),

    #[error("KV serialization error: {0}")]
    Serialization(String),

    #[error("KV store unavailable: {0}")]
    Unavailable(String),
}

/// Classification of a failure reported by the remote document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Connection dropped or never established
    Network,
    /// Attempt exceeded its deadline
    Timeout,
    /// 5xx-equivalent: service unavailable
    Unavailable,
    /// 5xx-equivalent: internal server failure
    Internal,
    /// 429-equivalent
    RateLimited,
    /// 400-equivalent: payload failed validation
    InvalidArgument,
    /// 403-equivalent
    PermissionDenied,
    /// 404-equivalent
    NotFound,
    /// 409/412-equivalent: precondition or version check failed server-side
    Conflict,
}

impl RemoteErrorKind {
    /// Whether a failure of this kind may succeed when retried.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            RemoteErrorKind::Network
                | RemoteErrorKind::Timeout
                | RemoteErrorKind::Unavailable
                | RemoteErrorKind::Internal
                | RemoteErrorKind::RateLimited
        )
    }
}

/// Error reported by a [`RemoteDocumentStore`](crate::remote::RemoteDocumentStore).
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
    /// What the server held when a conditional write was refused
    pub server_document: Option<Value>,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            server_document: None,
        }
    }

    /// A refused precondition, carrying the stored document when there is one.
    pub fn conflict(message: impl Into<String>, server_document: Option<Value>) -> Self {
        Self {
            server_document,
            ..Self::new(RemoteErrorKind::Conflict, message)
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Unavailable, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::PermissionDenied, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Mutation queue bookkeeping errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    #[error("failed to persist queue state: {0}")]
    Persistence(#[from] KvError),

    #[error("queue is full ({0} pending operations)")]
    Full(usize),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("unknown operation {0}")]
    UnknownOperation(String),

    #[error("persisted queue state is corrupt: {0}")]
    CorruptState(String),
}

/// Both sides of a rejected collaborative write.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictInfo {
    pub doc_id: String,
    /// Version the writer believed was current
    pub expected_version: u64,
    /// Version the server is known to hold
    pub server_version: u64,
    /// Content the writer tried to commit
    pub local_content: Value,
    /// Latest known server content
    pub server_content: Value,
    pub server_modified_by: Option<String>,
}

/// Caller-facing error type.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    /// Recoverable remote failure (only surfaced when not retried by the queue)
    #[error("transient remote failure: {0}")]
    Transient(RemoteError),

    /// Remote rejected the write; never retried
    #[error("write rejected: {0}")]
    Rejected(RemoteError),

    /// Local version check failed
    #[error(
        "version conflict on {}: expected v{}, server has v{}",
        .0.doc_id, .0.expected_version, .0.server_version
    )]
    Conflict(Box<ConflictInfo>),

    /// Remote reported a precondition/version failure
    #[error("remote conflict: {0}")]
    RemoteConflict(RemoteError),

    #[error("operation {operation_id} exhausted {attempts} delivery attempts: {last_error}")]
    ExhaustedRetries {
        operation_id: String,
        attempts: u32,
        last_error: RemoteError,
    },

    #[error("subscription error: {0}")]
    Subscription(RemoteError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] KvError),

    #[error("configuration error: {0}")]
    Config(String),

    /// The outcome channel closed before the operation settled
    #[error("operation {0} was abandoned before it settled")]
    Abandoned(String),
}

impl SyncError {
    /// Whether retrying the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    /// Conflict details, if this is a local version conflict.
    pub fn conflict(&self) -> Option<&ConflictInfo> {
        match self {
            SyncError::Conflict(info) => Some(info),
            _ => None,
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err.kind {
            RemoteErrorKind::Conflict => SyncError::RemoteConflict(err),
            kind if kind.is_retryable() => SyncError::Transient(err),
            _ => SyncError::Rejected(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retryable_kinds() {
        assert!(RemoteErrorKind::Network.is_retryable());
        assert!(RemoteErrorKind::Timeout.is_retryable());
        assert!(RemoteErrorKind::RateLimited.is_retryable());
        assert!(RemoteErrorKind::Internal.is_retryable());
        assert!(!RemoteErrorKind::PermissionDenied.is_retryable());
        assert!(!RemoteErrorKind::InvalidArgument.is_retryable());
        assert!(!RemoteErrorKind::Conflict.is_retryable());
    }

    #[test]
    fn test_remote_error_classification() {
        let err: SyncError = RemoteError::unavailable("503").into();
        assert!(matches!(err, SyncError::Transient(_)));
        assert!(err.is_retryable());

        let err: SyncError = RemoteError::permission_denied("nope").into();
        assert!(matches!(err, SyncError::Rejected(_)));
        assert!(!err.is_retryable());

        let err: SyncError = RemoteError::new(RemoteErrorKind::Conflict, "stale").into();
        assert!(matches!(err, SyncError::RemoteConflict(_)));
    }

    #[test]
    fn test_conflict_display_mentions_versions() {
        let err = SyncError::Conflict(Box::new(ConflictInfo {
            doc_id: "doc1".into(),
            expected_version: 3,
            server_version: 4,
            local_content: json!("mine"),
            server_content: json!("theirs"),
            server_modified_by: Some("alice".into()),
        }));
        let text = err.to_string();
        assert!(text.contains("doc1"));
        assert!(text.contains("v3"));
        assert!(text.contains("v4"));
        assert_eq!(err.conflict().map(|c| c.server_version), Some(4));
    }

    #[test]
    fn test_queue_error_from_kv() {
        let err: QueueError = KvError::Unavailable("disk full".into()).into();
        assert!(err.to_string().contains("disk full"));
        let err: SyncError = err.into();
        assert!(matches!(err, SyncError::Queue(QueueError::Persistence(_))));
    }
}
