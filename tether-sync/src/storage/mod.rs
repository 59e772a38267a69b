//! Durable key-value storage behind the mutation queue.
//!
//! Architecture:
//! ```text
//! ┌───────────────┐   get / set / delete   ┌──────────────────────┐
//! │ MutationQueue │ ─────────────────────► │ dyn KeyValueStore    │
//! │ (sole writer) │                        ├──────────────────────┤
//! └───────────────┘                        │ MemoryKvStore  tests │
//!                                          │ FileKvStore    disk  │
//!                                          └──────────────────────┘
//! ```
//!
//! Values are opaque bytes; the queue stores JSON blobs. Writes are
//! synchronous so that "durable before acknowledged" holds the moment
//! `set` returns.

pub mod file;
pub mod memory;

pub use file::FileKvStore;
pub use memory::MemoryKvStore;

use crate::error::KvError;

/// Byte-oriented durable store.
///
/// Implementations must make `set` durable before returning `Ok`.
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError>;

    /// Remove `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), KvError>;
}
