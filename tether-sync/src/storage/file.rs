//! File-backed key-value store.
//!
//! One file per key inside a directory. Each file holds a single
//! bincode-framed [`StoredRecord`] carrying the key and an FNV-1a checksum,
//! so truncated or foreign files are detected on read.
//!
//! Writes go to a temporary file in the same directory which is fsynced and
//! then atomically renamed over the target.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::KeyValueStore;
use crate::error::KvError;

const RECORD_EXTENSION: &str = "rec";

/// On-disk framing for one value.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    key: String,
    value: Vec<u8>,
    checksum: u32,
}

impl StoredRecord {
    fn new(key: &str, value: &[u8]) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_vec(),
            checksum: Self::compute_checksum(key, value),
        }
    }

    fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(&self.key, &self.value)
    }

    fn compute_checksum(key: &str, value: &[u8]) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in key.as_bytes().iter().chain(&[0u8]).chain(value) {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash
    }

    fn encode(&self) -> Result<Vec<u8>, KvError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| KvError::Serialization(e.to_string()))
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<Self, KvError> {
        let (record, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|_| KvError::Corrupt(key.to_string()))?;
        Ok(record)
    }
}

/// Directory of checksummed record files.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, KvError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| KvError::Io {
            key: dir.display().to_string(),
            message: e.to_string(),
        })?;
        log::debug!("Opened file KV store at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name for a key: hex-encoded so any key is a valid file name.
    fn path_for(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len() * 2 + 4);
        for byte in key.as_bytes() {
            name.push_str(&format!("{byte:02x}"));
        }
        name.push('.');
        name.push_str(RECORD_EXTENSION);
        self.dir.join(name)
    }

    fn io_error(key: &str, err: std::io::Error) -> KvError {
        KvError::Io {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

impl KeyValueStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let bytes = match fs::read(self.path_for(key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_error(key, e)),
        };

        let record = StoredRecord::decode(key, &bytes)?;
        if !record.verify() || record.key != key {
            log::warn!("Checksum mismatch for KV record '{key}'");
            return Err(KvError::Corrupt(key.to_string()));
        }
        Ok(Some(record.value))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let encoded = StoredRecord::new(key, value).encode()?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| Self::io_error(key, e))?;
        tmp.write_all(&encoded).map_err(|e| Self::io_error(key, e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Self::io_error(key, e))?;
        tmp.persist(self.path_for(key))
            .map_err(|e| Self::io_error(key, e.error))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip_and_overwrite() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::open(dir.path().join("kv")).unwrap();

        assert_eq!(store.get("tether/queue/log").unwrap(), None);
        store.set("tether/queue/log", b"[1]").unwrap();
        store.set("tether/queue/log", b"[1,2]").unwrap();
        assert_eq!(
            store.get("tether/queue/log").unwrap(),
            Some(b"[1,2]".to_vec())
        );
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileKvStore::open(dir.path()).unwrap();
            store.set("k", b"persisted").unwrap();
        }
        let reopened = FileKvStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get("k").unwrap(), Some(b"persisted".to_vec()));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();
        store.set("k", b"v").unwrap();
        store.delete("k").unwrap();
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_corrupted_file_detected() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();
        store.set("k", b"value").unwrap();

        fs::write(store.path_for("k"), [0xFF; 12]).unwrap();
        assert!(matches!(store.get("k"), Err(KvError::Corrupt(_))));
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();

        let mut record = StoredRecord::new("k", b"value");
        record.value[0] = b'V';
        fs::write(store.path_for("k"), record.encode().unwrap()).unwrap();
        assert!(matches!(store.get("k"), Err(KvError::Corrupt(_))));
    }

    #[test]
    fn test_keys_with_separators_do_not_collide() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();
        store.set("a/b", b"1").unwrap();
        store.set("a_b", b"2").unwrap();
        assert_eq!(store.get("a/b").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("a_b").unwrap(), Some(b"2".to_vec()));
    }
}
