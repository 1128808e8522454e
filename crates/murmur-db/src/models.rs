//! SQLite row types for users, rooms, messages and reactions, kept apart
//! from the wire models in murmur-types.
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;
use tracing::warn;

use murmur_types::models::{Preferences, Presence, User};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub is_admin: bool,
    pub online: bool,
    pub last_seen_at: String,
    pub custom_status: String,
    pub theme: String,
    pub notifications: bool,
    pub created_at: String,
}

pub(crate) const USER_COLUMNS: &str =
    "id, username, password, is_admin, online, last_seen_at, custom_status, theme, notifications, created_at";

impl UserRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            username: row.get(1)?,
            password: row.get(2)?,
            is_admin: row.get(3)?,
            online: row.get(4)?,
            last_seen_at: row.get(5)?,
            custom_status: row.get(6)?,
            theme: row.get(7)?,
            notifications: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    /// Public view; drops the password hash.
    pub fn into_user(self) -> User {
        User {
            presence: Presence {
                online: self.online,
                last_seen_at: parse_timestamp(&self.last_seen_at),
                custom_status: self.custom_status,
            },
            preferences: Preferences {
                theme: self.theme,
                notifications_enabled: self.notifications,
            },
            created_at: parse_timestamp(&self.created_at),
            id: self.id,
            username: self.username,
            is_admin: self.is_admin,
        }
    }
}

pub struct ChatRow {
    pub id: String,
    pub name: String,
    pub is_private: bool,
    pub created_at: String,
    pub updated_at: String,
}

pub(crate) const CHAT_COLUMNS: &str = "id, name, is_private, created_at, updated_at";

impl ChatRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            is_private: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }
}

pub struct MessageRow {
    pub seq: i64,
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub content: String,
    pub reply_to: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted: bool,
}

pub(crate) const MESSAGE_COLUMNS: &str =
    "seq, id, chat_id, sender_id, sender_name, content, reply_to, created_at, updated_at, deleted";

impl MessageRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            chat_id: row.get(2)?,
            sender_id: row.get(3)?,
            sender_name: row.get(4)?,
            content: row.get(5)?,
            reply_to: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            deleted: row.get(9)?,
        })
    }
}

pub struct ReactionRow {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: String,
}

/// Fixed-width RFC 3339 in UTC, so text order equals time order.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_roundtrip_keeps_micros() {
        let now = Utc::now();
        let parsed = parse_timestamp(&format_timestamp(&now));
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn corrupt_timestamp_falls_back_to_epoch() {
        assert_eq!(parse_timestamp("yesterday"), DateTime::<Utc>::default());
    }
}
