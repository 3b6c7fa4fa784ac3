//! File-backed secure store (AES-128-CTR + HMAC-SHA256, encrypt-then-MAC)
//!
//! Layout of an entry file: `MAGIC || IV (16) || ciphertext || tag (32)`.
//! The tag covers `MAGIC || key || IV || ciphertext`, so an entry copied
//! under another name fails verification.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::{validate_key, SecureStore, StorageError, StorageResult};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

const MAGIC: &[u8; 4] = b"MBS1";
const CIPHER_KEY_LEN: usize = 16;
const MAC_KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;
const MASTER_KEY_FILE: &str = "master.key";

pub struct EncryptedFileStore {
    dir: PathBuf,
    cipher_key: [u8; CIPHER_KEY_LEN],
    mac_key: [u8; MAC_KEY_LEN],
}

impl EncryptedFileStore {
    /// Open (or initialise) a store rooted at `dir`.
    ///
    /// The master key is generated on first use and kept next to the
    /// entries with owner-only permissions.
    pub fn open(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let key_path = dir.join(MASTER_KEY_FILE);
        let master = if key_path.exists() {
            let bytes = fs::read(&key_path)?;
            if bytes.len() != CIPHER_KEY_LEN + MAC_KEY_LEN {
                return Err(StorageError::Integrity(MASTER_KEY_FILE.to_string()));
            }
            bytes
        } else {
            let mut bytes = vec![0u8; CIPHER_KEY_LEN + MAC_KEY_LEN];
            getrandom::getrandom(&mut bytes).map_err(|e| StorageError::Encoding(e.to_string()))?;
            write_private(&key_path, &bytes)?;
            tracing::debug!("Generated new master key at {}", key_path.display());
            bytes
        };

        let mut cipher_key = [0u8; CIPHER_KEY_LEN];
        let mut mac_key = [0u8; MAC_KEY_LEN];
        cipher_key.copy_from_slice(&master[..CIPHER_KEY_LEN]);
        mac_key.copy_from_slice(&master[CIPHER_KEY_LEN..]);

        Ok(Self {
            dir,
            cipher_key,
            mac_key,
        })
    }

    fn entry_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{}.bin", key)))
    }

    fn tag(&self, key: &str, iv: &[u8], ciphertext: &[u8]) -> StorageResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key)
            .map_err(|e| StorageError::Encoding(e.to_string()))?;
        mac.update(MAGIC);
        mac.update(key.as_bytes());
        mac.update(iv);
        mac.update(ciphertext);
        Ok(mac)
    }

    fn seal(&self, key: &str, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        let mut iv = [0u8; IV_LEN];
        getrandom::getrandom(&mut iv).map_err(|e| StorageError::Encoding(e.to_string()))?;

        let mut ciphertext = plaintext.to_vec();
        let mut cipher = Aes128Ctr::new((&self.cipher_key).into(), &iv.into());
        cipher.apply_keystream(&mut ciphertext);

        let tag = self.tag(key, &iv, &ciphertext)?.finalize().into_bytes();

        let mut sealed = Vec::with_capacity(MAGIC.len() + IV_LEN + ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(MAGIC);
        sealed.extend_from_slice(&iv);
        sealed.extend_from_slice(&ciphertext);
        sealed.extend_from_slice(&tag);
        Ok(sealed)
    }

    fn unseal(&self, key: &str, sealed: &[u8]) -> StorageResult<Vec<u8>> {
        let header_len = MAGIC.len() + IV_LEN;
        if sealed.len() < header_len + TAG_LEN || &sealed[..MAGIC.len()] != MAGIC {
            return Err(StorageError::Integrity(key.to_string()));
        }

        let tag_offset = sealed.len() - TAG_LEN;
        let iv = &sealed[MAGIC.len()..header_len];
        let ciphertext = &sealed[header_len..tag_offset];

        self.tag(key, iv, ciphertext)?
            .verify_slice(&sealed[tag_offset..])
            .map_err(|_| StorageError::Integrity(key.to_string()))?;

        let mut iv_block = [0u8; IV_LEN];
        iv_block.copy_from_slice(iv);
        let mut plaintext = ciphertext.to_vec();
        let mut cipher = Aes128Ctr::new((&self.cipher_key).into(), &iv_block.into());
        cipher.apply_keystream(&mut plaintext);
        Ok(plaintext)
    }
}

impl SecureStore for EncryptedFileStore {
    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.entry_path(key)?;
        if !path.exists() {
            return Ok(None);
        }
        let sealed = fs::read(&path)?;
        self.unseal(key, &sealed).map(Some)
    }

    fn store(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let path = self.entry_path(key)?;
        let sealed = self.seal(key, value)?;

        // Write to a sibling file first so a crash never leaves a torn entry.
        let tmp = path.with_extension("tmp");
        write_private(&tmp, &sealed)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.entry_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write `bytes` to a file that is owner-only from the moment it exists.
fn write_private(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;

    // `mode` only applies on creation; tighten a file left by an older run.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> Self {
            let path = std::env::temp_dir().join(format!("msal-bridge-{}", uuid::Uuid::new_v4()));
            Self(path)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    #[test]
    fn test_store_and_reopen() {
        let dir = TempDir::new();
        {
            let store = EncryptedFileStore::open(&dir.0).unwrap();
            store.store("token_cache", b"{\"records\":[]}").unwrap();
        }

        let store = EncryptedFileStore::open(&dir.0).unwrap();
        let loaded = store.load("token_cache").unwrap().unwrap();
        assert_eq!(loaded, b"{\"records\":[]}");
    }

    #[test]
    fn test_entry_is_not_plaintext() {
        let dir = TempDir::new();
        let store = EncryptedFileStore::open(&dir.0).unwrap();
        store.store("secret", b"access-token-value").unwrap();

        let raw = fs::read(dir.0.join("secret.bin")).unwrap();
        let needle = b"access-token-value";
        assert!(!raw.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_tampered_entry_rejected() {
        let dir = TempDir::new();
        let store = EncryptedFileStore::open(&dir.0).unwrap();
        store.store("secret", b"payload").unwrap();

        let path = dir.0.join("secret.bin");
        let mut raw = fs::read(&path).unwrap();
        let mid = MAGIC.len() + IV_LEN;
        raw[mid] ^= 0x01;
        fs::write(&path, raw).unwrap();

        assert!(matches!(
            store.load("secret"),
            Err(StorageError::Integrity(_))
        ));
    }

    #[test]
    fn test_entry_bound_to_its_key() {
        let dir = TempDir::new();
        let store = EncryptedFileStore::open(&dir.0).unwrap();
        store.store("alpha", b"payload").unwrap();
        fs::copy(dir.0.join("alpha.bin"), dir.0.join("beta.bin")).unwrap();

        assert!(store.load("beta").is_err());
    }

    #[test]
    fn test_missing_and_delete() {
        let dir = TempDir::new();
        let store = EncryptedFileStore::open(&dir.0).unwrap();
        assert!(store.load("absent").unwrap().is_none());
        store.delete("absent").unwrap();

        store.store("present", b"x").unwrap();
        store.delete("present").unwrap();
        assert!(store.load("present").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new();
        let store = EncryptedFileStore::open(&dir.0).unwrap();
        store.store("token_cache", b"{}").unwrap();

        for name in [MASTER_KEY_FILE, "token_cache.bin"] {
            let mode = fs::metadata(dir.0.join(name)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{} is not owner-only", name);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_write_private_tightens_existing_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new();
        fs::create_dir_all(&dir.0).unwrap();
        let path = dir.0.join("loose.bin");
        fs::write(&path, b"old contents").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        write_private(&path, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_truncated_master_key_rejected() {
        let dir = TempDir::new();
        fs::create_dir_all(&dir.0).unwrap();
        fs::write(dir.0.join(MASTER_KEY_FILE), b"short").unwrap();
        assert!(EncryptedFileStore::open(&dir.0).is_err());
    }
}
