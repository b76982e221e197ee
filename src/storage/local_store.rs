//! Single-file object store for offline play.
//!
//! The whole key → value map lives in one CBOR database file, rewritten
//! atomically on every save. Values are written as CBOR byte strings, so the
//! file is the size of the blobs it holds plus a few bytes per key. Opened
//! without a path it is memory-only.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use ciborium::Value;
use serde::{Serialize, Serializer};
use tokio::sync::Mutex;

use super::{cbor_serialize, validate_key, BlobStore, Storage, StoreError};
use crate::common::constants::WorldConstants;

#[derive(Debug)]
pub struct LocalBlobStore {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl LocalBlobStore {
    /// Open (or create) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let entries: BTreeMap<String, Vec<u8>> = match tokio::fs::read(&path).await {
            Ok(bytes) => decode_table(&bytes).map_err(|reason| StoreError::Corrupt {
                key: path.display().to_string(),
                reason,
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(db = %path.display(), keys = entries.len(), "local store opened");
        Ok(LocalBlobStore {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    /// A store that forgets everything when dropped.
    pub fn in_memory() -> Self {
        LocalBlobStore {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn persist(&self, entries: &BTreeMap<String, Vec<u8>>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let table: BTreeMap<&str, Blob<'_>> = entries
            .iter()
            .map(|(key, value)| (key.as_str(), Blob(value)))
            .collect();
        let bytes = cbor_serialize(&table)?;
        let tmp = path.with_extension("db.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// A value as a CBOR byte string rather than an array of integers.
struct Blob<'a>(&'a [u8]);

impl Serialize for Blob<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0)
    }
}

fn decode_table(bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, String> {
    let value: Value = ciborium::from_reader(bytes).map_err(|e| e.to_string())?;
    let Value::Map(pairs) = value else {
        return Err("database root is not a map".to_string());
    };
    pairs
        .into_iter()
        .map(|pair| match pair {
            (Value::Text(key), Value::Bytes(value)) => Ok((key, value)),
            _ => Err("entry is not a text key with a byte string value".to_string()),
        })
        .collect()
}

impl BlobStore for LocalBlobStore {
    async fn save(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut entries = self.entries.lock().await;
        let previous = entries.insert(key.to_string(), value);
        if let Err(e) = self.persist(&entries).await {
            // Keep memory in step with the file that is actually on disk.
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        validate_key(key)?;
        self.entries
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }
}

impl Storage<LocalBlobStore> {
    /// `<dir>/users.db` and `<dir>/worlds.db`.
    pub async fn open_local(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        let users =
            LocalBlobStore::open(dir.join(format!("{}.db", WorldConstants::USERS_NAMESPACE))).await?;
        let worlds =
            LocalBlobStore::open(dir.join(format!("{}.db", WorldConstants::WORLDS_NAMESPACE))).await?;
        Ok(Storage::new(users, worlds))
    }

    pub fn in_memory() -> Self {
        Storage::new(LocalBlobStore::in_memory(), LocalBlobStore::in_memory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::world::World;
    use crate::storage::UserRecord;

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store = LocalBlobStore::in_memory();
        store.save("k", vec![4, 5]).await.unwrap();
        assert_eq!(store.load("k").await.unwrap(), vec![4, 5]);
        assert!(store.load("missing").await.unwrap_err().is_not_found());
        assert_eq!(store.list().await.unwrap(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn database_file_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("offline").join("worlds.db");
        {
            let store = LocalBlobStore::open(&db).await.unwrap();
            store.save("a", vec![1]).await.unwrap();
            store.save("b", vec![2]).await.unwrap();
            store.save("a", vec![3]).await.unwrap();
        }
        let store = LocalBlobStore::open(&db).await.unwrap();
        assert_eq!(store.load("a").await.unwrap(), vec![3]);
        assert_eq!(store.list().await.unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert!(!db.with_extension("db.tmp").exists());
    }

    #[tokio::test]
    async fn values_are_stored_as_byte_strings() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("worlds.db");
        let store = LocalBlobStore::open(&db).await.unwrap();
        store.save("big", vec![0xff; 4096]).await.unwrap();

        // An integer array would spend two bytes on every 0xff.
        let on_disk = std::fs::metadata(&db).unwrap().len();
        assert!(on_disk < 4096 + 32, "database is {on_disk} bytes");
        drop(store);
        let store = LocalBlobStore::open(&db).await.unwrap();
        assert_eq!(store.load("big").await.unwrap(), vec![0xff; 4096]);
    }

    #[tokio::test]
    async fn integer_array_values_are_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("users.db");
        let table: BTreeMap<String, Vec<u8>> = [("k".to_string(), vec![1, 2])].into();
        std::fs::write(&db, cbor_serialize(&table).unwrap()).unwrap();
        let err = LocalBlobStore::open(&db).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn garbage_database_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("users.db");
        std::fs::write(&db, [0xff, 0xff, 0xff]).unwrap();
        let err = LocalBlobStore::open(&db).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn local_storage_holds_users_and_worlds() {
        let tmp = tempfile::tempdir().unwrap();
        let world = World::empty("w1".into(), 4);
        {
            let storage = Storage::<LocalBlobStore>::open_local(tmp.path()).await.unwrap();
            storage
                .save_user("t1", &UserRecord { username: "alice".into() })
                .await
                .unwrap();
            storage.save_world(&world).await.unwrap();
        }
        let storage = Storage::<LocalBlobStore>::open_local(tmp.path()).await.unwrap();
        assert_eq!(storage.load_user("t1").await.unwrap().username, "alice");
        assert_eq!(storage.load_world("w1").await.unwrap(), world);
        assert_eq!(storage.list_worlds().await.unwrap(), vec!["w1".to_string()]);
    }
}
