//! Secure persistence for cached tokens, accounts and refresh tokens
//!
//! Nothing secret is written in plaintext: the on-disk backend is
//! [`EncryptedFileStore`]. [`MemoryStore`] keeps everything in process and is
//! what tests run against.

mod encrypted;

pub use encrypted::EncryptedFileStore;

use std::collections::HashMap;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Ciphertext failed authentication or has the wrong layout.
    #[error("integrity check failed for entry '{0}'")]
    Integrity(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("invalid entry key '{0}'")]
    InvalidKey(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Key/value store for secret material that must survive restarts.
pub trait SecureStore: Send + Sync {
    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;
    fn store(&self, key: &str, value: &[u8]) -> StorageResult<()>;
    fn delete(&self, key: &str) -> StorageResult<()>;
}

/// Entry keys double as file names, so they are kept to a safe alphabet.
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    let ok = !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

pub fn load_json<T: DeserializeOwned>(
    store: &dyn SecureStore,
    key: &str,
) -> StorageResult<Option<T>> {
    match store.load(key)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Encoding(e.to_string())),
        None => Ok(None),
    }
}

pub fn store_json<T: Serialize + ?Sized>(
    store: &dyn SecureStore,
    key: &str,
    value: &T,
) -> StorageResult<()> {
    let bytes = serde_json::to_vec(value).map_err(|e| StorageError::Encoding(e.to_string()))?;
    store.store(key, &bytes)
}

/// In-process store. Contents are lost when dropped.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureStore for MemoryStore {
    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.get(key).cloned())
    }

    fn store(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(key);
        Ok(())
    }
}
