//! The canonical in-memory copy of every world somebody is in.
//!
//! All sessions joined to a world hold the same `Arc<Mutex<World>>`. A
//! mutation, its save and its broadcast all happen under that world's lock,
//! so storage always sees edits in the order they were accepted and no
//! session can write back a copy that is missing a peer's edit.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::common::world::{World, WorldToken};
use crate::storage::{BlobStore, Storage, StoreError};

pub type SharedWorld = Arc<Mutex<World>>;

#[derive(Debug)]
struct OpenWorld {
    world: SharedWorld,
    holders: usize,
}

#[derive(Debug, Default)]
pub struct WorldRegistry {
    open: Mutex<HashMap<WorldToken, OpenWorld>>,
}

impl WorldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the open copy of `token`, loading it from storage if nobody
    /// holds it yet. Each successful call must be paired with a
    /// [`WorldRegistry::release`].
    pub async fn acquire<S: BlobStore>(
        &self,
        storage: &Storage<S>,
        token: &str,
    ) -> Result<SharedWorld, StoreError> {
        // Held across the load so two joiners never open two copies.
        let mut open = self.open.lock().await;
        if let Some(entry) = open.get_mut(token) {
            entry.holders += 1;
            return Ok(Arc::clone(&entry.world));
        }
        let world = Arc::new(Mutex::new(storage.load_world(token).await?));
        open.insert(
            token.to_string(),
            OpenWorld {
                world: Arc::clone(&world),
                holders: 1,
            },
        );
        tracing::debug!(world = token, "opened world");
        Ok(world)
    }

    /// Registers a freshly created world with one holder.
    pub async fn insert(&self, world: World) -> SharedWorld {
        let token = world.token.clone();
        let shared = Arc::new(Mutex::new(world));
        self.open.lock().await.insert(
            token,
            OpenWorld {
                world: Arc::clone(&shared),
                holders: 1,
            },
        );
        shared
    }

    /// Drops one hold on `token`. Returns true when it was the last one and
    /// the world was closed.
    pub async fn release(&self, token: &str) -> bool {
        let mut open = self.open.lock().await;
        let Some(entry) = open.get_mut(token) else {
            return false;
        };
        entry.holders = entry.holders.saturating_sub(1);
        if entry.holders > 0 {
            return false;
        }
        open.remove(token);
        tracing::debug!(world = token, "closed world");
        true
    }

    pub async fn holders(&self, token: &str) -> usize {
        self.open.lock().await.get(token).map_or(0, |entry| entry.holders)
    }

    pub async fn open_count(&self) -> usize {
        self.open.lock().await.len()
    }
}
