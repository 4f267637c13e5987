use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::RoomApi;
use crate::error::Result;
use crate::room::{Identity, Room};
use crate::store::RoomStore;
use crate::transport::{ConnectionState, TransportEvent, TransportHandle};

/// Lifecycle of one open room view. Every side effect (join, broadcast,
/// leave) is tied to a named transition; nothing fires from implicit
/// recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No room fetched yet.
    Idle,
    /// Room fetch and/or link establishment in flight.
    Joining,
    /// Steady state; local and authoritative text may briefly diverge
    /// while an edit is in flight.
    Synchronized,
    /// Link lost. Local edits are still accepted but not broadcast.
    Disconnected,
    /// Terminal. The view is closed and events are ignored.
    TornDown,
}

/// Reconciles local edits, remote broadcasts and server-confirmed state
/// for a single room view, without feedback loops or redundant traffic.
///
/// The loop guard is two pieces of private state: `last_known_text`
/// mirrors the store's code buffer and detects genuine remote changes;
/// `locally_updating` is held from the moment a local edit is applied
/// until the next reconciliation pass observes the store agreeing with it.
/// Without both, a store-observes-itself design re-broadcasts every one of
/// its own updates forever.
pub struct SyncController<A: RoomApi> {
    room_id: Uuid,
    identity: Identity,
    phase: Phase,
    store: RoomStore,
    transport: TransportHandle,
    api: A,
    last_known_text: String,
    locally_updating: bool,
    initialized: bool,
    offline_edits: bool,
}

impl<A: RoomApi> SyncController<A> {
    pub fn new(
        room_id: Uuid,
        identity: Identity,
        store: RoomStore,
        transport: TransportHandle,
        api: A,
    ) -> Self {
        Self {
            room_id,
            identity,
            phase: Phase::Idle,
            store,
            transport,
            api,
            last_known_text: String::new(),
            locally_updating: false,
            initialized: false,
            offline_edits: false,
        }
    }

    /// Opens the view: fetches the room, joins it on demand, seeds the
    /// store exactly once and attaches to the room channel.
    ///
    /// A fetch failure is fatal for the view and bubbles out; a join
    /// refusal is recoverable and lands in the store's error slot.
    pub async fn open(&mut self) -> Result<()> {
        self.phase = Phase::Joining;
        let room = self.api.room_by_id(self.room_id).await?;
        let room = self.ensure_membership(room).await;
        self.adopt_room(room);

        self.transport.join_room(self.room_id, self.identity.user_id);
        if self.transport.state() == ConnectionState::Connected {
            self.store.set_connected(true);
            self.phase = Phase::Synchronized;
        }
        info!(room = %self.room_id, user = %self.identity.username, "room view opened");
        Ok(())
    }

    /// Re-resolves the room snapshot (cache revalidation, membership
    /// refresh). Never resets the code buffer: initialization happens at
    /// most once per mount.
    pub async fn refetch(&mut self) -> Result<()> {
        if self.phase == Phase::TornDown {
            return Ok(());
        }
        let room = self.api.room_by_id(self.room_id).await?;
        let room = self.ensure_membership(room).await;
        self.adopt_room(room);
        Ok(())
    }

    /// Joins via the backend when the fetched roster lacks this user. The
    /// guard is the membership check itself, so refetches never re-fire
    /// the request.
    async fn ensure_membership(&mut self, room: Room) -> Room {
        if room.is_participant(self.identity.user_id) {
            return room;
        }
        debug!(room = %room.id, "not a participant yet, joining");
        match self.api.join_room(room.id).await {
            Ok(updated) => updated,
            Err(err) => {
                warn!(room = %room.id, error = %err, "join request failed");
                self.store.set_error(err.to_string());
                room
            }
        }
    }

    fn adopt_room(&mut self, room: Room) {
        if self.initialized {
            // Later resolutions refresh durable metadata only; the live
            // buffer (and any in-flight local edit) stays untouched.
            self.store.refresh_room_meta(room);
            return;
        }
        self.store.set_active_room(room);
        self.last_known_text = self.store.current_code().to_string();
        self.initialized = true;
    }

    /// A debounced local edit from the presentation layer.
    ///
    /// No-ops when the text matches the last known buffer or while a
    /// previous local change is still unreconciled; otherwise applies to
    /// the store and broadcasts. Returns whether a broadcast went out.
    pub fn handle_local_edit(&mut self, new_text: &str) -> bool {
        if matches!(self.phase, Phase::Idle | Phase::TornDown) {
            return false;
        }
        if new_text == self.last_known_text || self.locally_updating {
            return false;
        }

        self.last_known_text.clear();
        self.last_known_text.push_str(new_text);
        self.locally_updating = true;
        self.store.update_current_code(new_text);

        if self.store.is_connected() {
            self.transport
                .send_code_change(new_text, self.store.language());
            true
        } else {
            self.offline_edits = true;
            false
        }
    }

    /// The reconciliation pass. Run once per event-loop turn, never from
    /// inside the local-edit path: clearing `locally_updating`
    /// synchronously would let the local and remote paths race for the
    /// same change.
    pub fn reconcile(&mut self) {
        if self.store.current_code() != self.last_known_text {
            // The buffer moved underneath us: a genuine remote change won.
            self.last_known_text = self.store.current_code().to_string();
        }
        self.locally_updating = false;
    }

    pub fn on_transport_event(&mut self, event: TransportEvent) {
        if self.phase == Phase::TornDown {
            return;
        }
        match event {
            TransportEvent::Connected => {
                self.store.set_connected(true);
                match self.phase {
                    Phase::Joining if self.initialized => self.phase = Phase::Synchronized,
                    // No replay on this transport: the automatic re-join
                    // that follows a reconnect answers with a full room
                    // snapshot, which `RoomJoined` folds in below.
                    Phase::Disconnected => self.phase = Phase::Synchronized,
                    _ => {}
                }
            }
            TransportEvent::Disconnected => {
                self.store.set_connected(false);
                if !matches!(self.phase, Phase::Idle | Phase::TornDown) {
                    self.phase = Phase::Disconnected;
                }
            }
            TransportEvent::RoomJoined {
                code,
                language,
                theme,
                users,
                ..
            } => {
                self.store
                    .replace_roster(users.into_iter().map(|u| (u.user_id, u.username)));
                self.adopt_live_state(&code, &language, &theme);
                if self.phase == Phase::Joining && self.initialized {
                    self.phase = Phase::Synchronized;
                }
            }
            TransportEvent::CodeChange { text, .. } => {
                // Remote edits apply and are never re-broadcast; the
                // originating client already did.
                self.store.update_current_code(&text);
            }
            TransportEvent::LanguageChange { language } => {
                self.store.set_language(&language);
            }
            TransportEvent::ThemeChange { theme } => {
                self.store.set_theme(&theme);
            }
            TransportEvent::UserJoined {
                user_id, username, ..
            } => {
                self.store.user_attached(user_id, &username);
            }
            TransportEvent::UserLeft { user_id, .. } => {
                self.store.user_detached(user_id);
            }
            TransportEvent::Chat { .. } => {}
            TransportEvent::Snapshot {
                code,
                language,
                theme,
            } => {
                self.adopt_live_state(&code, &language, &theme);
            }
            TransportEvent::ServerError { message } => {
                self.store.set_error(message);
            }
        }
        self.reconcile();
    }

    /// Folds authoritative live state (join welcome or reconnect snapshot)
    /// into the store. A buffer that diverged while offline wins and is
    /// rebroadcast as the superseding full text.
    fn adopt_live_state(&mut self, code: &str, language: &str, theme: &str) {
        if self.offline_edits || self.locally_updating {
            self.offline_edits = false;
            if self.store.is_connected() && self.store.current_code() != code {
                self.transport
                    .send_code_change(self.store.current_code(), self.store.language());
            }
        } else {
            self.store.update_current_code(code);
        }
        self.store.set_language(language);
        self.store.set_theme(theme);
    }

    /// Broadcasts an editor-configuration change; any participant may.
    pub fn change_language(&mut self, language: &str) {
        self.store.set_language(language);
        if self.store.is_connected() {
            self.transport.change_language(language);
        }
    }

    pub fn change_theme(&mut self, theme: &str) {
        self.store.set_theme(theme);
        if self.store.is_connected() {
            self.transport.change_theme(theme);
        }
    }

    pub fn dismiss_error(&mut self) {
        self.store.dismiss_error();
    }

    /// Closes the view: leaves the room channel and drops into the
    /// terminal phase. Events arriving afterwards mutate nothing.
    /// Idempotent.
    pub fn teardown(&mut self) {
        if self.phase == Phase::TornDown {
            return;
        }
        self.transport.leave_room();
        self.store.clear_active_room();
        self.phase = Phase::TornDown;
        info!(room = %self.room_id, "room view torn down");
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn store(&self) -> &RoomStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::protocol::ClientEvent;
    use crate::room::{NewRoom, Participant, Role, RoomPatch};
    use crate::transport::{Command, detached_handle};
    use chrono::Utc;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct FakeApi {
        room: Arc<Mutex<Room>>,
        fail_join: bool,
        join_calls: Arc<AtomicUsize>,
        joiner: Identity,
    }

    impl FakeApi {
        fn new(room: Room, joiner: Identity) -> Self {
            Self {
                room: Arc::new(Mutex::new(room)),
                fail_join: false,
                join_calls: Arc::new(AtomicUsize::new(0)),
                joiner,
            }
        }
    }

    impl RoomApi for FakeApi {
        async fn room_by_id(&self, _id: Uuid) -> Result<Room> {
            Ok(self.room.lock().unwrap().clone())
        }

        async fn create_room(&self, _room: NewRoom) -> Result<Room> {
            unimplemented!("not used by the controller")
        }

        async fn join_room(&self, _id: Uuid) -> Result<Room> {
            self.join_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_join {
                return Err(SyncError::Join("room is full".to_string()));
            }
            let mut room = self.room.lock().unwrap();
            room.participants.push(Participant {
                user_id: self.joiner.user_id,
                username: self.joiner.username.clone(),
                role: Role::Participant,
            });
            Ok(room.clone())
        }

        async fn update_room(&self, _id: Uuid, _patch: RoomPatch) -> Result<Room> {
            unimplemented!("not used by the controller")
        }

        async fn search_rooms(&self, _query: &str) -> Result<Vec<Room>> {
            Ok(vec![])
        }

        async fn list_rooms(&self, _public_only: bool) -> Result<Vec<Room>> {
            Ok(vec![])
        }
    }

    fn identity(name: &str) -> Identity {
        Identity {
            user_id: Uuid::new_v4(),
            username: name.to_string(),
            token: "token".to_string(),
        }
    }

    fn room_with_member(me: &Identity) -> Room {
        Room {
            id: Uuid::new_v4(),
            name: "interview prep".to_string(),
            description: String::new(),
            language: "rust".to_string(),
            theme: "dark".to_string(),
            current_code: "fn main() {}".to_string(),
            is_private: false,
            tags: vec!["practice".to_string()],
            participants: vec![
                Participant {
                    user_id: Uuid::new_v4(),
                    username: "owner".to_string(),
                    role: Role::Owner,
                },
                Participant {
                    user_id: me.user_id,
                    username: me.username.clone(),
                    role: Role::Participant,
                },
            ],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn drain_sends(commands: &mut mpsc::UnboundedReceiver<Command>) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(cmd) = commands.try_recv() {
            if let Command::Send(event) = cmd {
                out.push(event);
            }
        }
        out
    }

    fn count_code_changes(events: &[ClientEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ClientEvent::CodeChange { .. }))
            .count()
    }

    async fn opened_controller(
        me: Identity,
        room: Room,
    ) -> (
        SyncController<FakeApi>,
        mpsc::UnboundedReceiver<Command>,
        tokio::sync::watch::Sender<crate::transport::ConnectionState>,
    ) {
        let (handle, commands, state) = detached_handle();
        let api = FakeApi::new(room.clone(), me.clone());
        let mut ctl = SyncController::new(room.id, me, RoomStore::new(), handle, api);
        ctl.open().await.expect("open");
        (ctl, commands, state)
    }

    #[tokio::test]
    async fn n_local_edits_produce_exactly_n_broadcasts() {
        let me = identity("alice");
        let (mut ctl, mut commands, _state) = opened_controller(me.clone(), room_with_member(&me)).await;
        drain_sends(&mut commands);

        for i in 0..5 {
            ctl.reconcile();
            assert!(ctl.handle_local_edit(&format!("draft {i}")));
            // The relay echoes every accepted change back to the sender.
            ctl.on_transport_event(TransportEvent::CodeChange {
                text: format!("draft {i}"),
                language: "rust".to_string(),
            });
        }

        let sent = drain_sends(&mut commands);
        assert_eq!(count_code_changes(&sent), 5);
    }

    #[tokio::test]
    async fn repeated_identical_edit_is_a_no_op() {
        let me = identity("alice");
        let (mut ctl, mut commands, _state) = opened_controller(me.clone(), room_with_member(&me)).await;
        drain_sends(&mut commands);

        ctl.reconcile();
        assert!(ctl.handle_local_edit("let x = 1;"));
        let revision = ctl.store().revision();
        ctl.reconcile();
        assert!(!ctl.handle_local_edit("let x = 1;"));

        assert_eq!(ctl.store().revision(), revision);
        assert_eq!(count_code_changes(&drain_sends(&mut commands)), 1);
    }

    #[tokio::test]
    async fn reentrant_edit_is_suppressed_until_reconciled() {
        let me = identity("alice");
        let (mut ctl, mut commands, _state) = opened_controller(me.clone(), room_with_member(&me)).await;
        drain_sends(&mut commands);

        ctl.reconcile();
        assert!(ctl.handle_local_edit("first"));
        // No reconciliation pass yet: the guard holds.
        assert!(!ctl.handle_local_edit("second"));
        ctl.reconcile();
        assert!(ctl.handle_local_edit("second"));

        assert_eq!(count_code_changes(&drain_sends(&mut commands)), 2);
    }

    #[tokio::test]
    async fn remote_edit_applies_without_rebroadcast() {
        let me = identity("bob");
        let (mut ctl, mut commands, _state) = opened_controller(me.clone(), room_with_member(&me)).await;
        drain_sends(&mut commands);

        ctl.on_transport_event(TransportEvent::CodeChange {
            text: "hello".to_string(),
            language: "rust".to_string(),
        });

        assert_eq!(ctl.store().current_code(), "hello");
        assert_eq!(count_code_changes(&drain_sends(&mut commands)), 0);

        // A remote overwrite also releases a pending local guard so the
        // next genuine local edit still propagates.
        assert!(ctl.handle_local_edit("hello world"));
        assert_eq!(count_code_changes(&drain_sends(&mut commands)), 1);
    }

    #[tokio::test]
    async fn refetch_never_reinitializes_the_store() {
        let me = identity("alice");
        let (mut ctl, mut commands, _state) = opened_controller(me.clone(), room_with_member(&me)).await;
        drain_sends(&mut commands);

        ctl.reconcile();
        assert!(ctl.handle_local_edit("work in progress"));

        // Background revalidation resolves again with the stale snapshot.
        ctl.refetch().await.expect("refetch");
        assert_eq!(ctl.store().current_code(), "work in progress");
        assert_eq!(count_code_changes(&drain_sends(&mut commands)), 1);
    }

    #[tokio::test]
    async fn mount_then_unmount_is_one_join_one_leave() {
        let me = identity("alice");
        let (mut ctl, mut commands, _state) = opened_controller(me.clone(), room_with_member(&me)).await;
        ctl.teardown();
        ctl.teardown();

        let sent = drain_sends(&mut commands);
        let joins = sent
            .iter()
            .filter(|e| matches!(e, ClientEvent::JoinRoom { .. }))
            .count();
        let leaves = sent
            .iter()
            .filter(|e| matches!(e, ClientEvent::LeaveRoom))
            .count();
        assert_eq!(joins, 1);
        assert_eq!(leaves, 1);

        // A delayed event after teardown must not touch state.
        ctl.on_transport_event(TransportEvent::CodeChange {
            text: "late".to_string(),
            language: "rust".to_string(),
        });
        assert_eq!(ctl.store().current_code(), "");
        assert_eq!(ctl.phase(), Phase::TornDown);
    }

    #[tokio::test]
    async fn offline_edits_survive_reconnect_and_rebroadcast() {
        let me = identity("alice");
        let (mut ctl, mut commands, _state) = opened_controller(me.clone(), room_with_member(&me)).await;
        drain_sends(&mut commands);

        ctl.on_transport_event(TransportEvent::Disconnected);
        assert_eq!(ctl.phase(), Phase::Disconnected);
        assert!(!ctl.store().is_connected());

        ctl.reconcile();
        assert!(!ctl.handle_local_edit("offline edit"));
        assert_eq!(ctl.store().current_code(), "offline edit");
        assert_eq!(count_code_changes(&drain_sends(&mut commands)), 0);

        ctl.on_transport_event(TransportEvent::Connected);
        assert_eq!(ctl.phase(), Phase::Synchronized);
        assert!(ctl.store().is_connected());

        // The transport re-joins automatically; the welcome carries the
        // last server-known text. The diverged local buffer wins and
        // goes back out as the superseding full text.
        ctl.on_transport_event(TransportEvent::RoomJoined {
            room_id: Uuid::new_v4(),
            code: "fn main() {}".to_string(),
            language: "rust".to_string(),
            theme: "dark".to_string(),
            users: vec![],
        });
        assert_eq!(ctl.store().current_code(), "offline edit");
        let resync = drain_sends(&mut commands);
        assert_eq!(count_code_changes(&resync), 1);
    }

    #[tokio::test]
    async fn clean_buffer_adopts_rejoin_snapshot() {
        let me = identity("alice");
        let (mut ctl, mut commands, _state) = opened_controller(me.clone(), room_with_member(&me)).await;
        drain_sends(&mut commands);

        ctl.on_transport_event(TransportEvent::Disconnected);
        ctl.on_transport_event(TransportEvent::Connected);
        ctl.on_transport_event(TransportEvent::RoomJoined {
            room_id: Uuid::new_v4(),
            code: "caught up".to_string(),
            language: "go".to_string(),
            theme: "light".to_string(),
            users: vec![],
        });

        assert_eq!(ctl.store().current_code(), "caught up");
        assert_eq!(ctl.store().language(), "go");
        assert_eq!(ctl.store().theme(), "light");
        assert_eq!(count_code_changes(&drain_sends(&mut commands)), 0);
    }

    #[tokio::test]
    async fn manual_resync_snapshot_adopts_when_clean() {
        let me = identity("alice");
        let (mut ctl, mut commands, _state) = opened_controller(me.clone(), room_with_member(&me)).await;
        drain_sends(&mut commands);

        ctl.on_transport_event(TransportEvent::Snapshot {
            code: "server copy".to_string(),
            language: "rust".to_string(),
            theme: "dark".to_string(),
        });
        assert_eq!(ctl.store().current_code(), "server copy");
        assert_eq!(count_code_changes(&drain_sends(&mut commands)), 0);
    }

    #[tokio::test]
    async fn nonmember_joins_exactly_once() {
        let me = identity("carol");
        let mut room = room_with_member(&me);
        room.participants.retain(|p| p.user_id != me.user_id);

        let (handle, mut commands, _state) = detached_handle();
        let api = FakeApi::new(room.clone(), me.clone());
        let join_calls = api.join_calls.clone();
        let mut ctl = SyncController::new(room.id, me, RoomStore::new(), handle, api);
        ctl.open().await.expect("open");
        assert_eq!(join_calls.load(Ordering::SeqCst), 1);

        // Now a participant: revalidation must not join again.
        ctl.refetch().await.expect("refetch");
        assert_eq!(join_calls.load(Ordering::SeqCst), 1);
        drain_sends(&mut commands);
    }

    #[tokio::test]
    async fn failed_join_is_recoverable() {
        let me = identity("carol");
        let mut room = room_with_member(&me);
        room.participants.retain(|p| p.user_id != me.user_id);

        let (handle, _commands, _state) = detached_handle();
        let mut api = FakeApi::new(room.clone(), me.clone());
        api.fail_join = true;
        let mut ctl = SyncController::new(room.id, me, RoomStore::new(), handle, api);
        ctl.open().await.expect("open despite join refusal");

        assert!(ctl.store().error().is_some());
        assert_eq!(ctl.store().current_code(), "fn main() {}");
        ctl.dismiss_error();
        assert!(ctl.store().error().is_none());
    }

    #[tokio::test]
    async fn roster_follows_presence_events() {
        let me = identity("alice");
        let (mut ctl, _commands, _state) = opened_controller(me.clone(), room_with_member(&me)).await;

        let visitor = Uuid::new_v4();
        ctl.on_transport_event(TransportEvent::UserJoined {
            user_id: visitor,
            username: "dave".to_string(),
            message: "dave joined".to_string(),
        });
        assert!(ctl.store().connected_users().contains_key(&visitor));

        ctl.on_transport_event(TransportEvent::UserLeft {
            user_id: visitor,
            message: "dave left".to_string(),
        });
        assert!(!ctl.store().connected_users().contains_key(&visitor));
    }
}
