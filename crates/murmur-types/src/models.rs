use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = String;
pub type ChatId = String;
pub type MessageId = String;

/// Identifies one live channel (a single WebSocket connection).
pub type ChannelId = Uuid;

/// Reserved sender id for server-authored messages.
pub const SYSTEM_SENDER: &str = "system";

/// Id of the broadcast room every authenticated user can join.
pub const GENERAL_CHAT_ID: &str = "general";
pub const GENERAL_CHAT_NAME: &str = "General";

/// Replacement content for a soft-deleted message.
pub const DELETED_CONTENT: &str = "This message has been deleted";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub online: bool,
    pub last_seen_at: DateTime<Utc>,
    pub custom_status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub theme: String,
    pub notifications_enabled: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            theme: "light".to_string(),
            notifications_enabled: true,
        }
    }
}

/// Partial preference update; absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesPatch {
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default, alias = "notifications")]
    pub notifications_enabled: Option<bool>,
}

impl Preferences {
    pub fn merge(&mut self, patch: PreferencesPatch) {
        if let Some(theme) = patch.theme {
            self.theme = theme;
        }
        if let Some(enabled) = patch.notifications_enabled {
            self.notifications_enabled = enabled;
        }
    }
}

/// Public view of a user. Password material never leaves the identity store,
/// so this type has no field for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub is_admin: bool,
    pub presence: Presence,
    pub preferences: Preferences,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub users: Vec<User>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub name: String,
    pub is_private: bool,
    /// Empty on a public room means the room is open to every authenticated user.
    pub participant_ids: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    pub fn is_open(&self) -> bool {
        !self.is_private && self.participant_ids.is_empty()
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant_ids.iter().any(|id| id == user_id)
    }

    /// Whether `user_id` may read from and post to this room.
    pub fn admits(&self, user_id: &str) -> bool {
        self.is_open() || self.has_participant(user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub user_id: UserId,
    pub emoji: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub content: String,
    pub reply_to: Option<MessageId>,
    pub reactions: Vec<Reaction>,
    pub read_by: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
}

impl Message {
    /// Number of readers other than the sender.
    pub fn read_count(&self) -> usize {
        self.read_by
            .iter()
            .filter(|id| **id != self.sender_id)
            .count()
    }
}

/// One entry of the administrative connection listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub user_id: UserId,
    pub username: Option<String>,
    pub channel_id: ChannelId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender: &str, read_by: &[&str]) -> Message {
        let now = Utc::now();
        Message {
            id: "m1".into(),
            chat_id: GENERAL_CHAT_ID.into(),
            sender_id: sender.into(),
            sender_name: None,
            content: "hi".into(),
            reply_to: None,
            reactions: vec![],
            read_by: read_by.iter().map(|s| s.to_string()).collect(),
            created_at: now,
            updated_at: now,
            deleted: false,
        }
    }

    #[test]
    fn read_count_excludes_sender() {
        assert_eq!(message("a", &["a"]).read_count(), 0);
        assert_eq!(message("a", &["a", "b", "c"]).read_count(), 2);
        // Never negative, even if the sender is somehow missing.
        assert_eq!(message("a", &[]).read_count(), 0);
    }

    #[test]
    fn preferences_merge_keeps_absent_fields() {
        let mut prefs = Preferences::default();
        prefs.merge(PreferencesPatch {
            theme: Some("dark".into()),
            notifications_enabled: None,
        });
        assert_eq!(prefs.theme, "dark");
        assert!(prefs.notifications_enabled);

        let patch: PreferencesPatch = serde_json::from_str(r#"{"notifications": false}"#).unwrap();
        prefs.merge(patch);
        assert_eq!(prefs.theme, "dark");
        assert!(!prefs.notifications_enabled);
    }

    #[test]
    fn open_room_admits_everyone() {
        let now = Utc::now();
        let mut chat = Chat {
            id: GENERAL_CHAT_ID.into(),
            name: GENERAL_CHAT_NAME.into(),
            is_private: false,
            participant_ids: vec![],
            created_at: now,
            updated_at: now,
        };
        assert!(chat.admits("anyone"));

        chat.is_private = true;
        chat.participant_ids = vec!["a".into(), "b".into()];
        assert!(chat.admits("a"));
        assert!(!chat.admits("c"));
    }
}
