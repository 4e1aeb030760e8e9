//! Non-volatile state store.
//!
//! A small keyed JSON document persisted to a single file so that a cold
//! restart can resume an in-flight transfer. Reads are forgiving: a
//! missing, truncated, or malformed file yields an empty view and the
//! file is left alone until the next write. Writes replace the whole
//! document atomically (write to a sibling temp file, then rename), so a
//! reader never observes a half-written document. Write failures are
//! logged and swallowed; the in-memory view stays authoritative.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, error, info};

/// DFU FSM state id (1..=3).
pub const KEY_CURRENT_STATE: &str = "current_state_id";
/// Firmware image size declared by the peer at init.
pub const KEY_FIRMWARE_IMAGE_SIZE: &str = "firmware_image_size";
/// Expected image digest, byte-reversed, as lower-case hex.
pub const KEY_FIRMWARE_IMAGE_SHA256: &str = "firmware_image_sha256";

pub struct NvmStore {
    path: PathBuf,
    doc: Map<String, Value>,
}

impl NvmStore {
    /// Open the store, loading whatever survives at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let doc = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(Value::Object(map)) => {
                    debug!(path = %path.display(), keys = map.len(), "loaded NVM document");
                    map
                }
                Ok(_) | Err(_) => {
                    debug!(path = %path.display(), "NVM document unreadable, starting empty");
                    Map::new()
                }
            },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no NVM document, starting empty");
                Map::new()
            }
        };

        info!(path = %path.display(), "NVM store initialized");
        Self { path, doc }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a key. An absent key is recorded as `null` (and persisted) so
    /// the document carries a stable key set from first access on.
    pub fn get(&mut self, key: &str) -> Value {
        if !self.doc.contains_key(key) {
            self.update(key, Value::Null);
        }
        self.doc[key].clone()
    }

    /// Update a key and rewrite the whole document.
    pub fn update(&mut self, key: &str, value: Value) {
        self.doc.insert(key.to_string(), value);
        self.persist();
    }

    /// Read a key as an unsigned integer, treating `null` and any
    /// non-numeric value as unset.
    pub fn get_u32(&mut self, key: &str) -> Option<u32> {
        self.get(key).as_u64().and_then(|v| u32::try_from(v).ok())
    }

    /// Read a key as a string, treating `null` as unset.
    pub fn get_str(&mut self, key: &str) -> Option<String> {
        match self.get(key) {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    fn persist(&self) {
        let bytes = match serde_json::to_vec(&self.doc) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "failed to serialize NVM document");
                return;
            }
        };

        let tmp = self.path.with_extension("tmp");
        let result = fs::write(&tmp, &bytes).and_then(|()| fs::rename(&tmp, &self.path));
        match result {
            Ok(()) => debug!(path = %self.path.display(), "NVM document updated"),
            Err(e) => error!(path = %self.path.display(), error = %e, "unable to update NVM file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reopen_recovers_last_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nvm");

        let mut nvm = NvmStore::open(&path);
        nvm.update(KEY_CURRENT_STATE, json!(2));
        nvm.update(KEY_FIRMWARE_IMAGE_SIZE, json!(160));
        nvm.update(KEY_FIRMWARE_IMAGE_SIZE, json!(320));

        let mut reopened = NvmStore::open(&path);
        assert_eq!(reopened.get_u32(KEY_CURRENT_STATE), Some(2));
        assert_eq!(reopened.get_u32(KEY_FIRMWARE_IMAGE_SIZE), Some(320));
    }

    #[test]
    fn corrupt_document_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nvm");
        fs::write(&path, b"{\"current_state_id\": 2").unwrap();

        let mut nvm = NvmStore::open(&path);
        assert_eq!(nvm.get_u32(KEY_CURRENT_STATE), None);
    }

    #[test]
    fn absent_key_recorded_as_null() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nvm");

        let mut nvm = NvmStore::open(&path);
        assert_eq!(nvm.get(KEY_FIRMWARE_IMAGE_SHA256), Value::Null);

        // The null sentinel is persisted, not just cached.
        let raw = fs::read_to_string(&path).unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        assert!(doc.get(KEY_FIRMWARE_IMAGE_SHA256).is_some());
        assert_eq!(doc[KEY_FIRMWARE_IMAGE_SHA256], Value::Null);
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nvm");

        let mut nvm = NvmStore::open(&path);
        nvm.update(KEY_CURRENT_STATE, json!(1));

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
