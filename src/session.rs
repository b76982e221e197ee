//! Per-connection state machine.
//!
//! ```text
//! Anonymous --Login--> Authenticated --NewWorld/JoinWorld--> WorldJoined
//!                           ^                                   |
//!                           +------------LeaveWorld-------------+
//! ```
//!
//! Sessions in the same world share one canonical copy from the
//! [`WorldRegistry`]. A mutation is applied, saved and broadcast under that
//! copy's lock; if the save fails the mutation is undone and nothing is
//! broadcast.

use std::sync::Arc;

use crate::common::protocol::{Message, MessageTag, Status};
use crate::common::terrain;
use crate::common::world::{PlayerState, World, WorldError, WorldToken};
use crate::error::SessionError;
use crate::registry::{SharedWorld, WorldRegistry};
use crate::router::{BroadcastRouter, Envelope, Outbox, SessionId};
use crate::storage::{BlobStore, Storage, StoreError, UserRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticated,
    WorldJoined,
}

struct Joined {
    token: WorldToken,
    world: SharedWorld,
}

pub struct Session<S> {
    id: SessionId,
    user: Option<User>,
    joined: Option<Joined>,
    storage: Arc<Storage<S>>,
    worlds: Arc<WorldRegistry>,
    router: Arc<BroadcastRouter>,
    outbox: Outbox,
    world_size: u32,
}

impl<S: BlobStore> Session<S> {
    /// `outbox` is where the router delivers messages for this session's
    /// active world.
    pub fn new(
        storage: Arc<Storage<S>>,
        worlds: Arc<WorldRegistry>,
        router: Arc<BroadcastRouter>,
        outbox: Outbox,
        world_size: u32,
    ) -> Self {
        Session {
            id: router.next_session_id(),
            user: None,
            joined: None,
            storage,
            worlds,
            router,
            outbox,
            world_size,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        match (&self.user, &self.joined) {
            (None, _) => SessionState::Anonymous,
            (Some(_), None) => SessionState::Authenticated,
            (Some(_), Some(_)) => SessionState::WorldJoined,
        }
    }

    pub fn current_user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn current_world_token(&self) -> Option<&str> {
        self.joined.as_ref().map(|joined| joined.token.as_str())
    }

    /// A snapshot of the active world, including every peer's edits.
    pub async fn current_world(&self) -> Option<World> {
        let joined = self.joined.as_ref()?;
        let world = joined.world.lock().await;
        Some(world.clone())
    }

    /// Processes one client message and returns the replies for the sender.
    /// Broadcasts to other sessions go through the router as a side effect.
    pub async fn handle(&mut self, message: Message) -> Result<Vec<Message>, SessionError> {
        let tag = message.tag();
        match message {
            Message::Register { username } => self.register(username).await,
            Message::Login { token } => self.login(token).await,
            Message::ListWorlds => self.list_worlds(tag).await,
            Message::NewWorld => self.new_world(tag).await,
            Message::JoinWorld { token } => self.join_world(tag, token).await,
            Message::UpdateVoxel { index, value } => self.update_voxel(tag, index, value).await,
            Message::UserMove {
                username,
                pos,
                azimuth,
                elevation,
                vel,
            } => {
                let state = PlayerState {
                    position: pos,
                    azimuth,
                    elevation,
                    velocity: vel,
                };
                self.user_move(tag, username, state).await
            }
            Message::LeaveWorld => self.leave_world(tag).await,
            Message::LoginStatus { .. }
            | Message::WorldList { .. }
            | Message::WorldData { .. }
            | Message::UserJoined { .. }
            | Message::UserLeft { .. } => Err(SessionError::Unexpected(tag)),
        }
    }

    /// Whether a routed message should be forwarded to this session's
    /// client. Messages routed to a world the session has since left are
    /// dropped. The shared world already holds the change.
    pub fn observe(&self, envelope: &Envelope) -> bool {
        self.current_world_token() == Some(envelope.world.as_str())
    }

    /// Detaches the session from routing and releases its world. No flush
    /// is needed: every mutation was already written through.
    pub async fn close(&mut self) {
        self.router.remove(self.id).await;
        if let Some(joined) = self.joined.take() {
            self.release(&joined.token).await;
        }
        self.user = None;
    }

    async fn register(&mut self, username: String) -> Result<Vec<Message>, SessionError> {
        let token = terrain::new_token();
        let record = UserRecord {
            username: username.clone(),
        };
        self.storage.save_user(&token, &record).await?;
        tracing::info!(session = %self.id, %username, "registered user");
        Ok(vec![Message::LoginStatus {
            username,
            token,
            status: Status::Success,
        }])
    }

    async fn login(&mut self, token: String) -> Result<Vec<Message>, SessionError> {
        let record = match self.storage.load_user(&token).await {
            Ok(record) => record,
            Err(e) if is_missing(&e) => {
                tracing::info!(session = %self.id, "login with unknown token");
                return Ok(vec![Message::login_failed()]);
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(session = %self.id, username = %record.username, "logged in");
        self.user = Some(User {
            username: record.username.clone(),
            token: token.clone(),
        });
        Ok(vec![Message::LoginStatus {
            username: record.username,
            token,
            status: Status::Success,
        }])
    }

    async fn list_worlds(&mut self, tag: MessageTag) -> Result<Vec<Message>, SessionError> {
        self.require_user(tag)?;
        let worlds = self.storage.list_worlds().await?;
        Ok(vec![Message::WorldList { worlds }])
    }

    async fn new_world(&mut self, tag: MessageTag) -> Result<Vec<Message>, SessionError> {
        self.require_user(tag)?;
        self.flush().await?;

        let world = terrain::generate(self.world_size);
        self.storage.save_world(&world).await?;
        tracing::info!(session = %self.id, world = %world.token, size = world.size, "created world");

        let token = world.token.clone();
        let reply = Message::WorldData {
            world: Some(world.clone()),
        };
        let shared = self.worlds.insert(world).await;
        self.leave_current().await;
        self.router.join(&token, self.id, self.outbox.clone()).await;
        self.joined = Some(Joined { token, world: shared });
        Ok(vec![reply])
    }

    async fn join_world(&mut self, tag: MessageTag, token: String) -> Result<Vec<Message>, SessionError> {
        let username = self.require_user(tag)?.username.clone();
        self.flush().await?;

        let shared = match self.worlds.acquire(&*self.storage, &token).await {
            Ok(shared) => shared,
            Err(e) if is_missing(&e) => {
                tracing::info!(session = %self.id, world = %token, "join of unknown world");
                return Ok(vec![Message::WorldData { world: None }]);
            }
            Err(e) => return Err(e.into()),
        };
        self.leave_current().await;

        // Joining the group and taking the snapshot under the world lock
        // means every edit is either in the snapshot or in our inbox.
        let snapshot = {
            let world = shared.lock().await;
            self.router.join(&token, self.id, self.outbox.clone()).await;
            self.router
                .route(&token, &Message::UserJoined { username }, Some(self.id))
                .await;
            world.clone()
        };
        tracing::info!(session = %self.id, world = %token, "joined world");
        self.joined = Some(Joined { token, world: shared });
        Ok(vec![Message::WorldData {
            world: Some(snapshot),
        }])
    }

    async fn update_voxel(
        &mut self,
        tag: MessageTag,
        index: u32,
        value: u8,
    ) -> Result<Vec<Message>, SessionError> {
        let state = self.state();
        let Some(joined) = &self.joined else {
            return Err(SessionError::Guard { tag, state });
        };
        let cell = index as usize;
        let mut world = joined.world.lock().await;
        let Some(&previous) = world.voxels.get(cell) else {
            return Err(WorldError::OutOfRange {
                index: cell,
                len: world.len(),
            }
            .into());
        };

        world.set_voxel_index(cell, value)?;
        if let Err(e) = self.storage.save_world(&world).await {
            world.set_voxel_index(cell, previous)?;
            return Err(e.into());
        }
        self.router
            .route(&joined.token, &Message::UpdateVoxel { index, value }, Some(self.id))
            .await;
        Ok(Vec::new())
    }

    async fn user_move(
        &mut self,
        tag: MessageTag,
        username: String,
        player: PlayerState,
    ) -> Result<Vec<Message>, SessionError> {
        let state = self.state();
        let Some(joined) = &self.joined else {
            return Err(SessionError::Guard { tag, state });
        };
        let mut world = joined.world.lock().await;
        let previous = world.players.get(&username).copied();

        world.upsert_player(&username, player);
        if let Err(e) = self.storage.save_world(&world).await {
            match previous {
                Some(old) => world.upsert_player(&username, old),
                None => {
                    world.players.remove(&username);
                }
            }
            return Err(e.into());
        }
        let relay = Message::UserMove {
            username,
            pos: player.position,
            azimuth: player.azimuth,
            elevation: player.elevation,
            vel: player.velocity,
        };
        self.router.route(&joined.token, &relay, Some(self.id)).await;
        Ok(Vec::new())
    }

    async fn leave_world(&mut self, tag: MessageTag) -> Result<Vec<Message>, SessionError> {
        let state = self.state();
        let (Some(user), Some(joined)) = (&self.user, self.joined.take()) else {
            return Err(SessionError::Guard { tag, state });
        };
        let username = user.username.clone();
        self.router.leave(&joined.token, self.id).await;
        self.router
            .route(&joined.token, &Message::UserLeft { username }, None)
            .await;
        self.release(&joined.token).await;
        tracing::info!(session = %self.id, world = %joined.token, "left world");
        Ok(Vec::new())
    }

    fn require_user(&self, tag: MessageTag) -> Result<&User, SessionError> {
        self.user.as_ref().ok_or(SessionError::Guard {
            tag,
            state: SessionState::Anonymous,
        })
    }

    /// Save-before-switch: persists the active world, if any.
    async fn flush(&self) -> Result<(), StoreError> {
        if let Some(joined) = &self.joined {
            let world = joined.world.lock().await;
            self.storage.save_world(&world).await?;
            tracing::debug!(session = %self.id, world = %joined.token, "flushed world");
        }
        Ok(())
    }

    /// Quietly drops the active world: no UserLeft, as on disconnect.
    async fn leave_current(&mut self) {
        if let Some(old) = self.joined.take() {
            self.router.leave(&old.token, self.id).await;
            self.release(&old.token).await;
        }
    }

    async fn release(&self, token: &str) {
        if self.worlds.release(token).await {
            self.storage.evict_world(token).await;
        }
    }
}

/// Lookups that can never succeed are answered like missing records.
fn is_missing(e: &StoreError) -> bool {
    matches!(e, StoreError::NotFound(_) | StoreError::InvalidKey(_))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::router::{outbox_channel, Inbox};
    use crate::storage::testing::flaky_storage;
    use crate::storage::{FileBlobStore, LocalBlobStore};

    const SIZE: u32 = 8;

    struct Harness<S> {
        storage: Arc<Storage<S>>,
        worlds: Arc<WorldRegistry>,
        router: Arc<BroadcastRouter>,
    }

    impl Harness<LocalBlobStore> {
        fn new() -> Self {
            Harness::with_storage(Storage::<LocalBlobStore>::in_memory())
        }
    }

    impl<S: BlobStore> Harness<S> {
        fn with_storage(storage: Storage<S>) -> Self {
            Harness {
                storage: Arc::new(storage),
                worlds: Arc::new(WorldRegistry::new()),
                router: Arc::new(BroadcastRouter::new()),
            }
        }

        fn session_of_size(&self, size: u32) -> (Session<S>, Inbox) {
            let (outbox, inbox) = outbox_channel();
            let session = Session::new(
                Arc::clone(&self.storage),
                Arc::clone(&self.worlds),
                Arc::clone(&self.router),
                outbox,
                size,
            );
            (session, inbox)
        }

        fn session(&self) -> (Session<S>, Inbox) {
            self.session_of_size(SIZE)
        }

        /// Registers `name` and logs the session in.
        async fn logged_in(&self, name: &str) -> (Session<S>, Inbox) {
            let (mut session, inbox) = self.session();
            let token = match session.handle(Message::Register { username: name.into() }).await.unwrap().remove(0) {
                Message::LoginStatus { token, .. } => token,
                other => panic!("unexpected reply {other:?}"),
            };
            session.handle(Message::Login { token }).await.unwrap();
            (session, inbox)
        }
    }

    fn only_world(replies: Vec<Message>) -> Option<World> {
        assert_eq!(replies.len(), 1);
        match replies.into_iter().next() {
            Some(Message::WorldData { world }) => world,
            other => panic!("expected WorldData, got {other:?}"),
        }
    }

    fn drain(inbox: &mut Inbox) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(envelope) = inbox.try_recv() {
            out.push(envelope.message);
        }
        out
    }

    #[tokio::test]
    async fn register_login_new_world_scenario() {
        let harness = Harness::new();
        let (mut session, _inbox) = harness.session_of_size(64);

        let replies = session.handle(Message::Register { username: "alice".into() }).await.unwrap();
        let Message::LoginStatus { username, token, status } = &replies[0] else {
            panic!("expected LoginStatus, got {replies:?}");
        };
        assert_eq!((username.as_str(), *status), ("alice", Status::Success));
        assert_eq!(session.state(), SessionState::Anonymous);

        let replies = session.handle(Message::Login { token: token.clone() }).await.unwrap();
        assert_eq!(
            replies,
            vec![Message::LoginStatus {
                username: "alice".into(),
                token: token.clone(),
                status: Status::Success,
            }]
        );
        assert_eq!(session.state(), SessionState::Authenticated);

        let world = only_world(session.handle(Message::NewWorld).await.unwrap()).unwrap();
        assert_eq!(world.voxels.len(), 64 * 64 * 64);
        assert!(world.players.is_empty());
        assert_eq!(session.state(), SessionState::WorldJoined);
        assert_eq!(harness.storage.load_world(&world.token).await.unwrap(), world);
    }

    #[tokio::test]
    async fn unknown_token_fails_login_without_state_change() {
        let harness = Harness::new();
        let (mut session, _inbox) = harness.session();
        let replies = session.handle(Message::Login { token: "nope".into() }).await.unwrap();
        assert_eq!(replies, vec![Message::login_failed()]);
        assert_eq!(session.state(), SessionState::Anonymous);

        let replies = session.handle(Message::Login { token: "../../etc".into() }).await.unwrap();
        assert_eq!(replies, vec![Message::login_failed()]);
    }

    #[tokio::test]
    async fn anonymous_new_world_is_dropped() {
        let harness = Harness::new();
        let (mut session, _inbox) = harness.session();

        let err = session.handle(Message::NewWorld).await.unwrap_err();
        assert!(matches!(err, SessionError::Guard { tag: MessageTag::NewWorld, state: SessionState::Anonymous }));
        assert!(err.is_dropped_message());
        assert!(session.current_world().await.is_none());
        assert!(harness.storage.list_worlds().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn world_commands_require_a_joined_world() {
        let harness = Harness::new();
        let (mut session, _inbox) = harness.logged_in("bob").await;

        for message in [
            Message::UpdateVoxel { index: 0, value: 1 },
            Message::LeaveWorld,
            Message::UserMove {
                username: "bob".into(),
                pos: [0.0; 3],
                azimuth: 0.0,
                elevation: 0.0,
                vel: [0.0; 3],
            },
        ] {
            let err = session.handle(message).await.unwrap_err();
            assert!(matches!(err, SessionError::Guard { state: SessionState::Authenticated, .. }));
        }
        assert!(matches!(
            session.handle(Message::ListWorlds).await.unwrap().as_slice(),
            [Message::WorldList { worlds }] if worlds.is_empty()
        ));
    }

    #[tokio::test]
    async fn list_worlds_enumerates_created_worlds() {
        let harness = Harness::new();
        let (mut session, _inbox) = harness.logged_in("carol").await;
        let first = only_world(session.handle(Message::NewWorld).await.unwrap()).unwrap();
        let second = only_world(session.handle(Message::NewWorld).await.unwrap()).unwrap();

        let replies = session.handle(Message::ListWorlds).await.unwrap();
        let Message::WorldList { worlds } = &replies[0] else {
            panic!("expected WorldList");
        };
        let mut expected = vec![first.token, second.token.clone()];
        expected.sort();
        assert_eq!(worlds, &expected);
        assert_eq!(session.current_world_token(), Some(second.token.as_str()));
    }

    #[tokio::test]
    async fn joining_a_missing_world_keeps_the_current_one() {
        let harness = Harness::new();
        let (mut session, _inbox) = harness.logged_in("dave").await;
        let world = only_world(session.handle(Message::NewWorld).await.unwrap()).unwrap();

        let replies = session
            .handle(Message::JoinWorld { token: "nonexistent-token".into() })
            .await
            .unwrap();
        assert_eq!(replies, vec![Message::WorldData { world: None }]);
        assert_eq!(session.current_world_token(), Some(world.token.as_str()));
        assert_eq!(session.state(), SessionState::WorldJoined);
        assert_eq!(harness.router.members(&world.token).await, vec![session.id()]);
    }

    #[tokio::test]
    async fn joining_a_missing_world_while_authenticated_stays_authenticated() {
        let harness = Harness::new();
        let (mut session, _inbox) = harness.logged_in("erin").await;
        let replies = session.handle(Message::JoinWorld { token: "ghost".into() }).await.unwrap();
        assert_eq!(replies, vec![Message::WorldData { world: None }]);
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn update_voxel_is_idempotent_and_persisted() {
        let harness = Harness::new();
        let (mut session, _inbox) = harness.logged_in("frank").await;
        let world = only_world(session.handle(Message::NewWorld).await.unwrap()).unwrap();

        session.handle(Message::UpdateVoxel { index: 17, value: 3 }).await.unwrap();
        let once = session.current_world().await.unwrap();
        session.handle(Message::UpdateVoxel { index: 17, value: 3 }).await.unwrap();
        assert_eq!(session.current_world().await.unwrap(), once);

        let stored = harness.storage.load_world(&world.token).await.unwrap();
        assert_eq!(stored.voxels[17], 3);
        assert_eq!(stored, once);
    }

    #[tokio::test]
    async fn out_of_range_voxel_is_dropped() {
        let harness = Harness::new();
        let (mut session, _inbox) = harness.logged_in("gina").await;
        let world = only_world(session.handle(Message::NewWorld).await.unwrap()).unwrap();

        let index = SIZE * SIZE * SIZE;
        let err = session.handle(Message::UpdateVoxel { index, value: 9 }).await.unwrap_err();
        assert!(matches!(err, SessionError::OutOfRange(_)));
        assert!(err.is_dropped_message());
        assert_eq!(harness.storage.load_world(&world.token).await.unwrap(), world);
    }

    #[tokio::test]
    async fn broadcasts_stay_inside_their_world() {
        let harness = Harness::new();
        let (mut in_a, mut inbox_a) = harness.logged_in("ann").await;
        let (mut peer_a, mut inbox_peer) = harness.logged_in("pat").await;
        let (mut in_b, mut inbox_b) = harness.logged_in("ben").await;

        let world_a = only_world(in_a.handle(Message::NewWorld).await.unwrap()).unwrap();
        only_world(in_b.handle(Message::NewWorld).await.unwrap()).unwrap();
        peer_a
            .handle(Message::JoinWorld { token: world_a.token.clone() })
            .await
            .unwrap();
        assert_eq!(drain(&mut inbox_a), vec![Message::UserJoined { username: "pat".into() }]);

        in_a.handle(Message::UpdateVoxel { index: 5, value: 2 }).await.unwrap();

        assert_eq!(drain(&mut inbox_peer), vec![Message::UpdateVoxel { index: 5, value: 2 }]);
        assert!(drain(&mut inbox_a).is_empty(), "sender must not get an echo");
        assert!(drain(&mut inbox_b).is_empty(), "other worlds must not see it");
    }

    #[tokio::test]
    async fn user_move_upserts_and_relays() {
        let harness = Harness::new();
        let (mut mover, _mover_inbox) = harness.logged_in("mo").await;
        let (mut watcher, mut watcher_inbox) = harness.logged_in("wes").await;
        let world = only_world(mover.handle(Message::NewWorld).await.unwrap()).unwrap();
        watcher.handle(Message::JoinWorld { token: world.token.clone() }).await.unwrap();

        let step = Message::UserMove {
            username: "mo".into(),
            pos: [1.0, 2.0, 3.0],
            azimuth: 0.5,
            elevation: -0.25,
            vel: [0.0, 0.0, 1.0],
        };
        mover.handle(step.clone()).await.unwrap();
        assert_eq!(drain(&mut watcher_inbox), vec![step]);

        let stored = harness.storage.load_world(&world.token).await.unwrap();
        assert_eq!(stored.players["mo"].position, [1.0, 2.0, 3.0]);
        assert_eq!(stored.players["mo"].velocity, [0.0, 0.0, 1.0]);
    }

    #[tokio::test]
    async fn leave_world_announces_and_returns_to_authenticated() {
        let harness = Harness::new();
        let (mut leaver, mut leaver_inbox) = harness.logged_in("lee").await;
        let (mut stayer, mut stayer_inbox) = harness.logged_in("sam").await;
        let world = only_world(stayer.handle(Message::NewWorld).await.unwrap()).unwrap();
        leaver.handle(Message::JoinWorld { token: world.token.clone() }).await.unwrap();
        drain(&mut stayer_inbox);

        assert!(leaver.handle(Message::LeaveWorld).await.unwrap().is_empty());
        assert_eq!(leaver.state(), SessionState::Authenticated);
        assert_eq!(drain(&mut stayer_inbox), vec![Message::UserLeft { username: "lee".into() }]);

        stayer.handle(Message::UpdateVoxel { index: 1, value: 1 }).await.unwrap();
        assert!(drain(&mut leaver_inbox).is_empty());
    }

    #[tokio::test]
    async fn new_world_flushes_and_leaves_the_previous_group() {
        let harness = Harness::new();
        let (mut session, _inbox) = harness.logged_in("hal").await;
        let first = only_world(session.handle(Message::NewWorld).await.unwrap()).unwrap();
        session.handle(Message::UpdateVoxel { index: 2, value: 4 }).await.unwrap();

        let second = only_world(session.handle(Message::NewWorld).await.unwrap()).unwrap();
        assert!(harness.router.members(&first.token).await.is_empty());
        assert_eq!(harness.router.members(&second.token).await, vec![session.id()]);
        assert_eq!(harness.storage.load_world(&first.token).await.unwrap().voxels[2], 4);
    }

    #[tokio::test]
    async fn interleaved_edits_from_two_sessions_are_both_kept() {
        let harness = Harness::new();
        let (mut a, _inbox_a) = harness.logged_in("ava").await;
        let (mut b, _inbox_b) = harness.logged_in("bo").await;
        let world = only_world(a.handle(Message::NewWorld).await.unwrap()).unwrap();
        b.handle(Message::JoinWorld { token: world.token.clone() }).await.unwrap();

        // Neither side reads its inbox between edits.
        a.handle(Message::UpdateVoxel { index: 5, value: 77 }).await.unwrap();
        b.handle(Message::UpdateVoxel { index: 6, value: 88 }).await.unwrap();
        a.handle(Message::UserMove {
            username: "ava".into(),
            pos: [1.0; 3],
            azimuth: 0.0,
            elevation: 0.0,
            vel: [0.0; 3],
        })
        .await
        .unwrap();

        let stored = harness.storage.load_world(&world.token).await.unwrap();
        assert_eq!((stored.voxels[5], stored.voxels[6]), (77, 88));
        assert!(stored.players.contains_key("ava"));
        assert_eq!(a.current_world().await.unwrap(), stored);
        assert_eq!(b.current_world().await.unwrap(), stored);
        assert_eq!(harness.worlds.holders(&world.token).await, 2);
    }

    #[tokio::test]
    async fn failed_saves_leave_the_world_untouched() {
        let (storage, failing) = flaky_storage();
        let harness = Harness::with_storage(storage);
        let (mut editor, _editor_inbox) = harness.logged_in("fay").await;
        let (mut peer, mut peer_inbox) = harness.logged_in("pip").await;
        let world = only_world(editor.handle(Message::NewWorld).await.unwrap()).unwrap();
        peer.handle(Message::JoinWorld { token: world.token.clone() }).await.unwrap();
        let before = editor.current_world().await.unwrap();

        failing.store(true, Ordering::SeqCst);
        let value = before.voxels[9].wrapping_add(1);
        let err = editor
            .handle(Message::UpdateVoxel { index: 9, value })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Storage(_)));
        assert!(!err.is_dropped_message());
        let err = editor
            .handle(Message::UserMove {
                username: "fay".into(),
                pos: [4.0; 3],
                azimuth: 0.0,
                elevation: 0.0,
                vel: [0.0; 3],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Storage(_)));

        assert_eq!(editor.current_world().await.unwrap(), before);
        assert_eq!(peer.current_world().await.unwrap(), before);
        assert_eq!(harness.storage.load_world(&world.token).await.unwrap(), before);
        assert!(drain(&mut peer_inbox).is_empty());

        failing.store(false, Ordering::SeqCst);
        editor.handle(Message::UpdateVoxel { index: 9, value }).await.unwrap();
        assert_eq!(drain(&mut peer_inbox), vec![Message::UpdateVoxel { index: 9, value }]);
        assert_eq!(harness.storage.load_world(&world.token).await.unwrap().voxels[9], value);
    }

    #[tokio::test]
    async fn last_session_out_evicts_the_cached_world() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::<FileBlobStore>::open_dir(tmp.path()).await.unwrap();
        let harness = Harness::with_storage(storage);
        let (mut first, _first_inbox) = harness.logged_in("uma").await;
        let (mut second, _second_inbox) = harness.logged_in("vic").await;
        let world = only_world(first.handle(Message::NewWorld).await.unwrap()).unwrap();
        second.handle(Message::JoinWorld { token: world.token.clone() }).await.unwrap();
        let blobs = harness.storage.world_store();
        assert!(blobs.is_cached(&world.token).await);

        first.handle(Message::LeaveWorld).await.unwrap();
        assert!(blobs.is_cached(&world.token).await);
        second.close().await;
        assert!(!blobs.is_cached(&world.token).await);
        assert_eq!(harness.worlds.open_count().await, 0);
        assert_eq!(harness.storage.load_world(&world.token).await.unwrap(), world);
    }

    #[tokio::test]
    async fn stale_envelopes_are_discarded() {
        let harness = Harness::new();
        let (mut session, _inbox) = harness.logged_in("sid").await;
        let world = only_world(session.handle(Message::NewWorld).await.unwrap()).unwrap();
        let message = Message::UpdateVoxel { index: 0, value: 7 };
        let stale = Envelope {
            world: "some-old-world".into(),
            message: message.clone(),
        };
        assert!(!session.observe(&stale));
        let current = Envelope {
            world: world.token,
            message,
        };
        assert!(session.observe(&current));
    }

    #[tokio::test]
    async fn server_messages_from_clients_are_rejected() {
        let harness = Harness::new();
        let (mut session, _inbox) = harness.logged_in("mal").await;
        let err = session.handle(Message::UserJoined { username: "x".into() }).await.unwrap_err();
        assert!(matches!(err, SessionError::Unexpected(MessageTag::UserJoined)));
    }

    #[tokio::test]
    async fn close_unregisters_from_routing() {
        let harness = Harness::new();
        let (mut session, _inbox) = harness.logged_in("cal").await;
        let world = only_world(session.handle(Message::NewWorld).await.unwrap()).unwrap();
        session.close().await;
        assert!(harness.router.members(&world.token).await.is_empty());
        assert_eq!(session.state(), SessionState::Anonymous);
        assert_eq!(harness.worlds.open_count().await, 0);
    }
}
