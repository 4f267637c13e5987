use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user currently attached to a room channel (live presence).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterUser {
    pub user_id: Uuid,
    pub username: String,
}

/// Frames sent by a client. One JSON object per line.
///
/// `Hello` must be the first frame on a fresh connection; everything else
/// is fire-and-forget with at-most-once delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    Hello {
        token: String,
        user_id: Uuid,
        username: String,
    },
    JoinRoom {
        room_id: Uuid,
        user_id: Uuid,
    },
    LeaveRoom,
    CodeChange {
        text: String,
        language: String,
    },
    LanguageChange {
        language: String,
    },
    ThemeChange {
        theme: String,
    },
    Chat {
        message: String,
    },
    SnapshotRequest,
}

/// Frames sent by the relay. Code, language and theme updates are echoed
/// to every member of the room, the sender included.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    Joined {
        room_id: Uuid,
        code: String,
        language: String,
        theme: String,
        users: Vec<RosterUser>,
    },
    CodeChange {
        text: String,
        language: String,
    },
    LanguageChange {
        language: String,
    },
    ThemeChange {
        theme: String,
    },
    UserJoined {
        message: String,
        user_id: Uuid,
        username: String,
    },
    UserLeft {
        message: String,
        user_id: Uuid,
    },
    Chat {
        user_id: Uuid,
        username: String,
        message: String,
    },
    Snapshot {
        code: String,
        language: String,
        theme: String,
    },
    Error {
        message: String,
    },
}
