//! World-scoped fan-out of messages to live sessions.
//!
//! The router only knows which session outboxes are attached to which world.
//! Groups change on join, leave and disconnect; a route takes a snapshot of
//! the group under the read guard and sends after releasing it, so a
//! concurrent disconnect can never be observed half-applied.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};

use crate::common::protocol::Message;
use crate::common::world::WorldToken;

/// Unique identifier for a session within one server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// A routed message and the world it was routed for. Sessions use the
/// world to discard messages queued before they switched worlds.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub world: WorldToken,
    pub message: Message,
}

/// Sending half of a session's routed-message queue.
pub type Outbox = mpsc::UnboundedSender<Envelope>;
pub type Inbox = mpsc::UnboundedReceiver<Envelope>;

pub fn outbox_channel() -> (Outbox, Inbox) {
    mpsc::unbounded_channel()
}

#[derive(Debug)]
pub struct BroadcastRouter {
    groups: RwLock<HashMap<WorldToken, HashMap<SessionId, Outbox>>>,
    next_id: AtomicU64,
}

impl BroadcastRouter {
    pub fn new() -> Self {
        BroadcastRouter {
            groups: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`SessionId`].
    pub fn next_session_id(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Attach `session` to `world`. A session belongs to at most one world,
    /// so any previous membership is dropped.
    pub async fn join(&self, world: &str, session: SessionId, outbox: Outbox) {
        let mut groups = self.groups.write().await;
        detach(&mut groups, session);
        groups
            .entry(world.to_string())
            .or_default()
            .insert(session, outbox);
        tracing::debug!(%session, world, "joined broadcast group");
    }

    /// Detach `session` from `world`. Returns whether it was a member.
    pub async fn leave(&self, world: &str, session: SessionId) -> bool {
        let mut groups = self.groups.write().await;
        let Some(group) = groups.get_mut(world) else {
            return false;
        };
        let removed = group.remove(&session).is_some();
        if group.is_empty() {
            groups.remove(world);
        }
        removed
    }

    /// Drop `session` from every group. Called when its transport closes.
    pub async fn remove(&self, session: SessionId) {
        let mut groups = self.groups.write().await;
        detach(&mut groups, session);
    }

    /// Deliver `message` to every session attached to `world` except
    /// `exclude`. Returns how many outboxes accepted it.
    pub async fn route(&self, world: &str, message: &Message, exclude: Option<SessionId>) -> usize {
        let targets: Vec<(SessionId, Outbox)> = {
            let groups = self.groups.read().await;
            match groups.get(world) {
                Some(group) => group
                    .iter()
                    .filter(|(id, _)| Some(**id) != exclude)
                    .map(|(id, outbox)| (*id, outbox.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut delivered = 0;
        for (id, outbox) in targets {
            let envelope = Envelope {
                world: world.to_string(),
                message: message.clone(),
            };
            if outbox.send(envelope).is_ok() {
                delivered += 1;
            } else {
                tracing::debug!(session = %id, world, "skipping closed outbox");
            }
        }
        tracing::trace!(world, tag = ?message.tag(), delivered, "routed");
        delivered
    }

    /// Sessions currently attached to `world`, sorted.
    pub async fn members(&self, world: &str) -> Vec<SessionId> {
        let groups = self.groups.read().await;
        let mut ids: Vec<SessionId> = groups
            .get(world)
            .map(|group| group.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }
}

impl Default for BroadcastRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn detach(groups: &mut HashMap<WorldToken, HashMap<SessionId, Outbox>>, session: SessionId) {
    groups.retain(|_, group| {
        group.remove(&session);
        !group.is_empty()
    });
}
