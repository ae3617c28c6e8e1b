//! Secure key storage and small-blob persistence.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::error::{ClientError, Result};

/// Secret key-value storage.
#[async_trait]
pub trait SecureStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Named JSON blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<Value>>;
    async fn save(&self, name: &str, value: &Value) -> Result<()>;
}

fn checked_name(name: &str) -> Result<&str> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(name)
    } else {
        Err(ClientError::Storage(format!("invalid key name: {name:?}")))
    }
}

/// Write `data` to `path` through a temp file in the same directory, with
/// `mode` applied before the file becomes visible. Runs on the blocking pool.
async fn write_atomic(path: PathBuf, data: Vec<u8>, mode: Option<u32>) -> Result<()> {
    tokio::task::spawn_blocking(move || write_atomic_sync(&path, &data, mode))
        .await
        .map_err(|e| ClientError::Storage(format!("write aborted: {e}")))?
}

fn write_atomic_sync(path: &Path, data: &[u8], mode: Option<u32>) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| ClientError::Storage(format!("no parent for {}", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = mode {
            tmp.as_file().set_permissions(std::fs::Permissions::from_mode(mode))?;
        }
    }
    #[cfg(not(unix))]
    let _ = mode;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ClientError::Storage(e.to_string()))?;
    Ok(())
}

/// One file per secret under `<root>/secure`, owner-readable only on unix.
pub struct FileSecureStore {
    root: PathBuf,
}

impl FileSecureStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into().join("secure"),
        }
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(checked_name(key)?))
    }
}

#[async_trait]
impl SecureStore for FileSecureStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path(key)?).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        write_atomic(self.path(key)?, value.as_bytes().to_vec(), Some(0o600)).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// `<root>/blobs/<name>.json`.
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into().join("blobs"),
        }
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.root.join(format!("{}.json", checked_name(name)?)))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn load(&self, name: &str) -> Result<Option<Value>> {
        match tokio::fs::read(self.path(name)?).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, name: &str, value: &Value) -> Result<()> {
        write_atomic(self.path(name)?, serde_json::to_vec_pretty(value)?, None).await
    }
}

/// In-memory secure store.
#[derive(Default)]
pub struct MemorySecureStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySecureStore {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SecureStore for MemorySecureStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries().remove(key);
        Ok(())
    }
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Value>>,
}

impl MemoryBlobStore {
    fn blobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn load(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.blobs().get(name).cloned())
    }

    async fn save(&self, name: &str, value: &Value) -> Result<()> {
        self.blobs().insert(name.to_string(), value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn secure_store_set_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = FileSecureStore::new(dir.path());
        assert_eq!(store.get("privkey").await.unwrap(), None);
        store.set("privkey", "abc").await.unwrap();
        assert_eq!(store.get("privkey").await.unwrap().as_deref(), Some("abc"));
        store.delete("privkey").await.unwrap();
        store.delete("privkey").await.unwrap();
        assert_eq!(store.get("privkey").await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn secure_files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let store = FileSecureStore::new(dir.path());
        store.set("privkey", "abc").await.unwrap();
        let mode = std::fs::metadata(dir.path().join("secure/privkey"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn blob_store_persists_json() {
        let dir = TempDir::new().unwrap();
        let blobs = FileBlobStore::new(dir.path());
        assert!(blobs.load("meta").await.unwrap().is_none());
        blobs.save("meta", &json!({"username": "a"})).await.unwrap();
        let reopened = FileBlobStore::new(dir.path());
        assert_eq!(reopened.load("meta").await.unwrap(), Some(json!({"username": "a"})));
    }

    #[tokio::test]
    async fn path_like_names_are_refused() {
        let dir = TempDir::new().unwrap();
        let blobs = FileBlobStore::new(dir.path());
        assert!(blobs.save("../escape", &json!(1)).await.is_err());
        assert!(FileSecureStore::new(dir.path()).get("a/b").await.is_err());
    }
}
