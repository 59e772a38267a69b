//! Configuration for the sync core.
//!
//! Durations are stored as milliseconds so a JSON file can override any
//! subset of fields; missing fields fall back to [`Default`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::SyncError;

/// Mutation queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Delivery attempts before an operation is dead-lettered. Default: 5.
    pub max_attempts: u32,
    /// Backoff for the first retry. Default: 500ms.
    pub base_delay_ms: u64,
    /// Backoff ceiling. Default: 30s.
    pub max_delay_ms: u64,
    /// Fraction of each backoff delay that is randomized, in [0, 1]. Default: 0.5.
    pub jitter: f64,
    /// Deadline for a single delivery attempt. Default: 10s.
    pub delivery_timeout_ms: u64,
    /// Maximum pending operations. Default: 10,000.
    pub max_pending: usize,
    /// Key prefix in the durable store. Default: "tether/queue".
    pub storage_prefix: String,
    /// Queue event channel capacity. Default: 256.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.5,
            delivery_timeout_ms: 10_000,
            max_pending: 10_000,
            storage_prefix: "tether/queue".to_string(),
            event_capacity: 256,
        }
    }
}

impl QueueConfig {
    /// Config for testing (short deterministic backoff, few attempts).
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 40,
            jitter: 0.0,
            delivery_timeout_ms: 200,
            max_pending: 1_000,
            storage_prefix: "test/queue".to_string(),
            event_capacity: 256,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.max_attempts == 0 {
            return Err(SyncError::Config("queue.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(SyncError::Config(format!(
                "queue.jitter must be within [0, 1], got {}",
                self.jitter
            )));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(SyncError::Config(
                "queue.base_delay_ms exceeds queue.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Optimistic cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which an unreferenced entry may be evicted. Default: 5 minutes.
    pub staleness_window_ms: u64,
    /// Cache event channel capacity. Default: 256.
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            staleness_window_ms: 5 * 60 * 1000,
            event_capacity: 256,
        }
    }
}

impl CacheConfig {
    pub fn for_testing() -> Self {
        Self {
            staleness_window_ms: 1_000,
            event_capacity: 64,
        }
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.staleness_window_ms)
    }
}

/// Collaborative editing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Debounce delay for session edits. Default: 1s.
    pub debounce_ms: u64,
    /// Remote collection holding collaborative documents. Default: "documents".
    pub collection: String,
    /// Conflict event channel capacity. Default: 128.
    pub event_capacity: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1_000,
            collection: "documents".to_string(),
            event_capacity: 128,
        }
    }
}

impl CollabConfig {
    pub fn for_testing() -> Self {
        Self {
            debounce_ms: 50,
            collection: "documents".to_string(),
            event_capacity: 64,
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Top-level configuration handed to [`SyncCore::open`](crate::client::SyncCore::open).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub collab: CollabConfig,
}

impl SyncConfig {
    pub fn for_testing() -> Self {
        Self {
            queue: QueueConfig::for_testing(),
            cache: CacheConfig::for_testing(),
            collab: CollabConfig::for_testing(),
        }
    }

    /// Parse a (possibly partial) JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, SyncError> {
        let config: SyncConfig =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        self.queue.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.queue.delivery_timeout(), Duration::from_secs(10));
        assert_eq!(config.cache.staleness_window(), Duration::from_secs(300));
        assert_eq!(config.collab.debounce(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_override() {
        let config = SyncConfig::from_json_str(
            r#"{ "queue": { "max_attempts": 9 }, "collab": { "collection": "prompts" } }"#,
        )
        .unwrap();
        assert_eq!(config.queue.max_attempts, 9);
        assert_eq!(config.queue.base_delay_ms, 500);
        assert_eq!(config.collab.collection, "prompts");
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = SyncConfig::from_json_str(r#"{ "queue": { "jitter": 2.0 } }"#).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));

        let err = SyncConfig::from_json_str(r#"{ "queue": { "max_attempts": 0 } }"#).unwrap_err();
        assert!(err.to_string().contains("max_attempts"));

        assert!(SyncConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_testing_config_is_valid() {
        assert!(SyncConfig::for_testing().validate().is_ok());
    }
}
