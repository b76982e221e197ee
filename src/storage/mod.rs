//! Durable key → value persistence for users and worlds.
//!
//! A [`BlobStore`] holds raw bytes under string keys. Structured records go
//! through [`BlobStore::save_record`] / [`BlobStore::load_record`], which use
//! CBOR so nested maps and numeric arrays round-trip unchanged.
//!
//! Two backends share the contract:
//! - [`FileBlobStore`]: one file per key in a directory (server side).
//! - [`LocalBlobStore`]: a single-file object store for offline play, or a
//!   purely in-memory one for tests.
//!
//! [`Storage`] pairs a "users" and a "worlds" namespace, each its own store.

pub mod file_store;
pub mod local_store;

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::common::world::World;

pub use file_store::FileBlobStore;
pub use local_store::LocalBlobStore;

/// Errors from blob store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no value stored under key {0:?}")]
    NotFound(String),
    #[error("invalid key {0:?}")]
    InvalidKey(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    Encode(String),
    #[error("CBOR deserialization error: {0}")]
    Decode(String),
    #[error("corrupt record {key:?}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Async key → bytes store. Implementations must keep a single key's value
/// whole under concurrent writers: the last completed `save` wins.
pub trait BlobStore: Send + Sync {
    fn save(&self, key: &str, value: Vec<u8>) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Fails with [`StoreError::NotFound`] when nothing is stored under `key`.
    fn load(&self, key: &str) -> impl Future<Output = Result<Vec<u8>, StoreError>> + Send;

    fn list(&self) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    /// Drops any in-memory copy of `key`. Stored data is untouched.
    fn evict(&self, _key: &str) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn save_record<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move {
            let bytes = cbor_serialize(value)?;
            self.save(key, bytes).await
        }
    }

    fn load_record<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<T, StoreError>> + Send {
        async move {
            let bytes = self.load(key).await?;
            cbor_deserialize(&bytes)
        }
    }
}

/// Rejects keys that could escape a store directory or collide with
/// temp files.
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let bad = key.is_empty()
        || key.starts_with('.')
        || key.contains(['/', '\\', '\0']);
    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

pub(crate) fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::Encode(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn cbor_deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(data).map_err(|e| StoreError::Decode(e.to_string()))
}

/// What the users namespace stores under a login token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
}

/// The two namespaces a server or offline session works against.
#[derive(Debug)]
pub struct Storage<S> {
    users: S,
    worlds: S,
}

impl<S: BlobStore> Storage<S> {
    pub fn new(users: S, worlds: S) -> Self {
        Storage { users, worlds }
    }

    pub async fn save_user(&self, token: &str, record: &UserRecord) -> Result<(), StoreError> {
        self.users.save_record(token, record).await
    }

    pub async fn load_user(&self, token: &str) -> Result<UserRecord, StoreError> {
        self.users.load_record(token).await
    }

    pub async fn save_world(&self, world: &World) -> Result<(), StoreError> {
        self.worlds.save_record(&world.token, world).await
    }

    /// Loads a world and checks its voxel array matches its size.
    pub async fn load_world(&self, token: &str) -> Result<World, StoreError> {
        let world: World = self.worlds.load_record(token).await?;
        world.check_shape().map_err(|e| StoreError::Corrupt {
            key: token.to_string(),
            reason: e.to_string(),
        })?;
        Ok(world)
    }

    pub async fn list_worlds(&self) -> Result<Vec<String>, StoreError> {
        self.worlds.list().await
    }

    /// Called once no session holds the world any more.
    pub async fn evict_world(&self, token: &str) {
        self.worlds.evict(token).await
    }

    #[cfg(test)]
    pub(crate) fn world_store(&self) -> &S {
        &self.worlds
    }
}
