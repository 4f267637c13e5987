use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable membership role. Every room has exactly one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Participant,
}

/// A user durably recorded as a member of a room. Distinct from live
/// presence, which only exists while a transport channel is attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
}

/// A named collaborative session wrapping one shared code buffer and its
/// editor configuration. Owned by the backend; clients hold cached copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub language: String,
    pub theme: String,
    #[serde(default)]
    pub current_code: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    /// Checks the roster invariant: exactly one owner, no duplicate users.
    pub fn roster_is_valid(&self) -> bool {
        let owners = self
            .participants
            .iter()
            .filter(|p| p.role == Role::Owner)
            .count();
        if owners != 1 {
            return false;
        }
        let mut seen = Vec::with_capacity(self.participants.len());
        for p in &self.participants {
            if seen.contains(&p.user_id) {
                return false;
            }
            seen.push(p.user_id);
        }
        true
    }
}

/// Body for `POST /rooms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRoom {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub language: String,
    pub theme: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub current_code: String,
}

/// Body for `PATCH /rooms/:id`. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_private: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// Who this client is on the wire. The token is opaque to us; the relay and
/// the REST backend decide what it means.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(role: Role) -> Participant {
        Participant {
            user_id: Uuid::new_v4(),
            username: "someone".to_string(),
            role,
        }
    }

    fn room_with(participants: Vec<Participant>) -> Room {
        Room {
            id: Uuid::new_v4(),
            name: "rust study".to_string(),
            description: String::new(),
            language: "rust".to_string(),
            theme: "dark".to_string(),
            current_code: String::new(),
            is_private: false,
            tags: vec![],
            participants,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn roster_requires_exactly_one_owner() {
        assert!(room_with(vec![participant(Role::Owner)]).roster_is_valid());
        assert!(!room_with(vec![participant(Role::Participant)]).roster_is_valid());
        assert!(
            !room_with(vec![participant(Role::Owner), participant(Role::Owner)])
                .roster_is_valid()
        );
    }

    #[test]
    fn roster_rejects_duplicate_users() {
        let owner = participant(Role::Owner);
        let dup = Participant {
            user_id: owner.user_id,
            username: owner.username.clone(),
            role: Role::Participant,
        };
        assert!(!room_with(vec![owner, dup]).roster_is_valid());
    }

    #[test]
    fn membership_check() {
        let owner = participant(Role::Owner);
        let id = owner.user_id;
        let room = room_with(vec![owner]);
        assert!(room.is_participant(id));
        assert!(!room.is_participant(Uuid::new_v4()));
    }
}
