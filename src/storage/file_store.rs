//! Directory-backed blob store.
//!
//! Layout inside the store directory:
//! ```text
//! <key>                    - one file per stored value
//! .<key>.<uuid>.tmp        - in-flight write, renamed over <key> on success
//! ```

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use uuid::Uuid;

use super::{validate_key, BlobStore, Storage, StoreError};
use crate::common::constants::WorldConstants;

/// One file per key. Reads are cached in memory after the first load;
/// writes always go through to disk.
#[derive(Debug)]
pub struct FileBlobStore {
    root: PathBuf,
    cache: RwLock<HashMap<String, Vec<u8>>>,
}

impl FileBlobStore {
    /// Open a store rooted at `path`, creating the directory if needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(FileBlobStore {
            root,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    #[cfg(test)]
    pub(crate) async fn is_cached(&self, key: &str) -> bool {
        self.cache.read().await.contains_key(key)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

impl BlobStore for FileBlobStore {
    async fn save(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let tmp = self
            .root
            .join(format!(".{key}.{}.tmp", Uuid::new_v4().simple()));

        // Readers never see a half-written file: the value lands under a
        // private name first and is renamed into place.
        if let Err(e) = tokio::fs::write(&tmp, &value).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        // Rename and cache update happen under one guard so the cache never
        // disagrees with the file that won.
        let mut cache = self.cache.write().await;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        cache.insert(key.to_string(), value);
        tracing::trace!(store = %self.root.display(), key, "blob saved");
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        if let Some(bytes) = self.cache.read().await.get(key) {
            return Ok(bytes.clone());
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        // A save may have landed while we were reading; its value wins.
        let mut cache = self.cache.write().await;
        Ok(cache.entry(key.to_string()).or_insert(bytes).clone())
    }

    async fn evict(&self, key: &str) {
        self.cache.write().await.remove(key);
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if validate_key(&name).is_ok() {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

impl Storage<FileBlobStore> {
    /// `<data_dir>/users` and `<data_dir>/worlds`.
    pub async fn open_dir(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        let users = FileBlobStore::open(data_dir.join(WorldConstants::USERS_NAMESPACE)).await?;
        let worlds = FileBlobStore::open(data_dir.join(WorldConstants::WORLDS_NAMESPACE)).await?;
        Ok(Storage::new(users, worlds))
    }
}
