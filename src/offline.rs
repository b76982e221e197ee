//! Single-player mode: the server stack runs inside the client process,
//! backed by the local database file instead of the data directory.

use std::path::Path;

use crate::server::WorldServer;
use crate::storage::{LocalBlobStore, Storage, StoreError};
use crate::transport::{Connection, LoopbackTransport};

pub struct LocalServer {
    server: WorldServer<LocalBlobStore>,
}

impl LocalServer {
    /// Opens `<dir>/users.db` and `<dir>/worlds.db`.
    pub async fn open(dir: impl AsRef<Path>, world_size: u32) -> Result<Self, StoreError> {
        let storage = Storage::<LocalBlobStore>::open_local(dir.as_ref()).await?;
        tracing::info!(dir = %dir.as_ref().display(), "offline server ready");
        Ok(LocalServer {
            server: WorldServer::new(storage, world_size),
        })
    }

    /// Nothing is written to disk.
    pub fn in_memory(world_size: u32) -> Self {
        LocalServer {
            server: WorldServer::new(Storage::<LocalBlobStore>::in_memory(), world_size),
        }
    }

    /// Starts a session and returns the client end of its link. Must be
    /// called inside a tokio runtime.
    pub fn connect(&self) -> Connection<LoopbackTransport> {
        self.server.connect_loopback()
    }

    pub fn storage(&self) -> &Storage<LocalBlobStore> {
        self.server.storage()
    }
}
