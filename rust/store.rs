//! Per-origin persistence. Relying parties are isolated from each other by
//! construction: every stored value is keyed by an origin-scoped string, and
//! nothing outside this module reads or writes the underlying medium.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;

pub const KEYRING_SERVICE_NAME: &str = "identify_broker";

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Filesystem store, one file per key under a data directory. Values are
/// written atomically with 0600 permissions since they can contain session
/// key material.
pub struct FsStore {
    dir: PathBuf,
}

impl FsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn default_dir() -> Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME is not set")?;
        Ok(PathBuf::from(home).join(".config/identify-broker"))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Origins contain '/' and ':'; keep file names flat and reversible.
        let encoded: String = key
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '.' | '_' => c,
                _ => '+',
            })
            .collect();
        let digest = ring::digest::digest(&ring::digest::SHA256, key.as_bytes());
        let suffix = hex::encode(&digest.as_ref()[..8]);
        self.dir.join(format!("{encoded}-{suffix}.json"))
    }

    fn write_atomic(path: &Path, value: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create store directory at {}", parent.display()))?;
        }
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .with_context(|| format!("Failed to open temp store file at {}", tmp_path.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perm = fs::Permissions::from_mode(0o600);
                fs::set_permissions(&tmp_path, perm)
                    .with_context(|| format!("Failed to set permissions on {}", tmp_path.display()))?;
            }
            file.write_all(value).context("Failed to write store value")?;
            file.sync_all().context("Failed to sync store file")?;
        }
        fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to move store file into place at {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FsStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to read store file at {}", path.display()))
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        Self::write_atomic(&self.path_for(key), value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to delete store file at {}", path.display()))
            }
        }
    }
}

/// OS keyring store. Values are hex-encoded since keyring backends only take
/// passwords, not raw bytes.
pub struct KeyringStore;

#[async_trait]
impl KeyValueStore for KeyringStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entry = keyring::Entry::new(KEYRING_SERVICE_NAME, key)?;
        match entry.get_password() {
            Ok(encoded) => Ok(Some(hex::decode(encoded).context("Corrupt keyring entry")?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(anyhow!("Keyring error: {err:?}")),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let entry = keyring::Entry::new(KEYRING_SERVICE_NAME, key)?;
        entry
            .set_password(&hex::encode(value))
            .map_err(|err| anyhow!("Keyring error: {err:?}"))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let entry = keyring::Entry::new(KEYRING_SERVICE_NAME, key)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(anyhow!("Keyring error: {err:?}")),
        }
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn shared() -> Arc<dyn KeyValueStore> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::default();
        assert!(store.get("session:https://app.example.com").await.unwrap().is_none());
        store.set("session:https://app.example.com", b"abc").await.unwrap();
        assert_eq!(
            store.get("session:https://app.example.com").await.unwrap(),
            Some(b"abc".to_vec())
        );
        store.delete("session:https://app.example.com").await.unwrap();
        assert!(store.get("session:https://app.example.com").await.unwrap().is_none());
    }

    #[test]
    fn fs_store_uses_distinct_paths_per_origin() {
        let store = FsStore::new("/tmp/identify-broker-test");
        let a = store.path_for("delegation:https://a.example.com");
        let b = store.path_for("delegation:https://b.example.com");
        assert_ne!(a, b);
    }
}
