use std::collections::BTreeMap;

use uuid::Uuid;

use crate::room::Room;

/// Single source of truth, within one client, for the active room's display
/// state. All mutations are synchronous and go through named operations;
/// the store never distinguishes whether a code overwrite came from a local
/// edit or a remote broadcast.
///
/// One store is owned by exactly one controller. It is constructor-injected,
/// never a process-wide singleton, so two open views can never bleed state
/// into each other.
#[derive(Debug, Default)]
pub struct RoomStore {
    active_room: Option<Room>,
    current_code: String,
    language: String,
    theme: String,
    connected: bool,
    connected_users: BTreeMap<Uuid, String>,
    error: Option<String>,
    revision: u64,
}

impl RoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the active room snapshot. The controller guarantees this is
    /// called at most once per mount; the store itself only enforces that a
    /// previous room was cleared first.
    pub fn set_active_room(&mut self, room: Room) {
        debug_assert!(self.active_room.is_none(), "room switched without clear");
        self.current_code = room.current_code.clone();
        self.language = room.language.clone();
        self.theme = room.theme.clone();
        self.active_room = Some(room);
        self.revision += 1;
    }

    /// Resets to the uninitialized state. Called on unmount and before any
    /// room switch.
    pub fn clear_active_room(&mut self) {
        self.active_room = None;
        self.current_code.clear();
        self.language.clear();
        self.theme.clear();
        self.connected_users.clear();
        self.error = None;
        self.revision += 1;
    }

    /// Refreshes the cached durable snapshot (name, roster, tags) without
    /// touching the live editor fields. Used when a background fetch
    /// re-resolves while the view is mounted.
    pub fn refresh_room_meta(&mut self, room: Room) {
        if self.active_room.is_some() {
            self.active_room = Some(room);
        }
    }

    /// The single mutation point for the code buffer, local and remote alike.
    pub fn update_current_code(&mut self, text: &str) {
        if self.current_code != text {
            self.current_code.clear();
            self.current_code.push_str(text);
            self.revision += 1;
        }
    }

    pub fn set_language(&mut self, language: &str) {
        if self.language != language {
            self.language = language.to_string();
            self.revision += 1;
        }
    }

    pub fn set_theme(&mut self, theme: &str) {
        if self.theme != theme {
            self.theme = theme.to_string();
            self.revision += 1;
        }
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn user_attached(&mut self, user_id: Uuid, username: &str) {
        self.connected_users.insert(user_id, username.to_string());
    }

    pub fn user_detached(&mut self, user_id: Uuid) {
        self.connected_users.remove(&user_id);
    }

    pub fn replace_roster(&mut self, users: impl IntoIterator<Item = (Uuid, String)>) {
        self.connected_users = users.into_iter().collect();
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn dismiss_error(&mut self) {
        self.error = None;
    }

    pub fn active_room(&self) -> Option<&Room> {
        self.active_room.as_ref()
    }

    pub fn current_code(&self) -> &str {
        &self.current_code
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn theme(&self) -> &str {
        &self.theme
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn connected_users(&self) -> &BTreeMap<Uuid, String> {
        &self.connected_users
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Bumped on every visible change to code/language/theme, so a render
    /// loop can poll for divergence without subscribing to callbacks.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}
