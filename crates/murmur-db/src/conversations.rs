use std::sync::Arc;

use chrono::Utc;
use rusqlite::{Connection, params};
use tracing::info;
use uuid::Uuid;

use murmur_types::models::{Chat, ChatId, UserId};

use crate::identity::query_user_by_id;
use crate::models::{CHAT_COLUMNS, ChatRow, format_timestamp, parse_timestamp};
use crate::{Database, DirectoryError, DirectoryResult, OptionalExt};

/// Conversation directory: rooms and their membership.
#[derive(Clone)]
pub struct Conversations {
    db: Arc<Database>,
}

impl Conversations {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create a public room with a fixed id unless it already exists.
    /// Safe to call at every start and from the self-heal path.
    pub fn ensure_broadcast_room(&self, id: &str, name: &str) -> DirectoryResult<Chat> {
        let now = format_timestamp(&Utc::now());
        self.db.with_conn(|conn| {
            let created = conn.execute(
                "INSERT OR IGNORE INTO chats (id, name, is_private, created_at, updated_at)
                 VALUES (?1, ?2, 0, ?3, ?3)",
                params![id, name, now],
            )?;
            if created == 1 {
                info!("Created broadcast room {} ({})", name, id);
            }
            load_chat(conn, id)?.ok_or_else(|| DirectoryError::not_found("chat", id))
        })
    }

    /// Return the direct room for this pair, creating it on first use.
    /// Argument order does not matter.
    pub fn create_direct_room(&self, a: &str, b: &str) -> DirectoryResult<Chat> {
        if a == b {
            return Err(DirectoryError::Validation(
                "A direct chat needs two different users".into(),
            ));
        }
        let key = direct_key(a, b);

        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            if let Some(existing) = find_by_direct_key(&tx, &key)? {
                return Ok(existing);
            }

            for user_id in [a, b] {
                if query_user_by_id(&tx, user_id)?.is_none() {
                    return Err(DirectoryError::not_found("user", user_id));
                }
            }

            let id = Uuid::new_v4().to_string();
            let now = format_timestamp(&Utc::now());
            tx.execute(
                "INSERT INTO chats (id, name, is_private, direct_key, created_at, updated_at)
                 VALUES (?1, ?2, 1, ?3, ?4, ?4)",
                params![id, format!("{}-{}", a, b), key, now],
            )?;
            for user_id in [a, b] {
                tx.execute(
                    "INSERT INTO chat_participants (chat_id, user_id) VALUES (?1, ?2)",
                    params![id, user_id],
                )?;
            }

            let chat = load_chat(&tx, &id)?.ok_or_else(|| DirectoryError::not_found("chat", &id))?;
            tx.commit()?;

            info!("Created direct room {} for {} and {}", id, a, b);
            Ok(chat)
        })
    }

    pub fn find_direct_room(&self, a: &str, b: &str) -> DirectoryResult<Option<Chat>> {
        let key = direct_key(a, b);
        self.db.with_conn(|conn| find_by_direct_key(conn, &key))
    }

    pub fn get_room(&self, id: &str) -> DirectoryResult<Option<Chat>> {
        self.db.with_conn(|conn| load_chat(conn, id))
    }

    /// Rooms the user participates in plus open broadcast rooms,
    /// most recently updated first.
    pub fn rooms_for(&self, user_id: &str) -> DirectoryResult<Vec<Chat>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id FROM chats c
                 WHERE EXISTS (SELECT 1 FROM chat_participants p WHERE p.chat_id = c.id AND p.user_id = ?1)
                    OR (c.is_private = 0 AND NOT EXISTS (SELECT 1 FROM chat_participants p WHERE p.chat_id = c.id))",
            )?;
            let ids = stmt
                .query_map([user_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut chats = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(chat) = load_chat(conn, id)? {
                    chats.push(chat);
                }
            }
            chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
            Ok(chats)
        })
    }

    /// Add a member to a group room. Bumps `updatedAt` only when the
    /// membership actually changed.
    pub fn add_participant(&self, chat_id: &str, user_id: &str) -> DirectoryResult<Chat> {
        self.change_membership(chat_id, user_id, |conn| {
            Ok(conn.execute(
                "INSERT OR IGNORE INTO chat_participants (chat_id, user_id) VALUES (?1, ?2)",
                params![chat_id, user_id],
            )? == 1)
        })
    }

    pub fn remove_participant(&self, chat_id: &str, user_id: &str) -> DirectoryResult<Chat> {
        self.change_membership(chat_id, user_id, |conn| {
            Ok(conn.execute(
                "DELETE FROM chat_participants WHERE chat_id = ?1 AND user_id = ?2",
                params![chat_id, user_id],
            )? == 1)
        })
    }

    fn change_membership<F>(&self, chat_id: &str, user_id: &str, apply: F) -> DirectoryResult<Chat>
    where
        F: FnOnce(&Connection) -> DirectoryResult<bool>,
    {
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let is_direct: bool = tx
                .query_row(
                    "SELECT direct_key IS NOT NULL FROM chats WHERE id = ?1",
                    [chat_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| DirectoryError::not_found("chat", chat_id))?;
            if is_direct {
                return Err(DirectoryError::Validation(
                    "Direct chat membership is fixed".into(),
                ));
            }
            if query_user_by_id(&tx, user_id)?.is_none() {
                return Err(DirectoryError::not_found("user", user_id));
            }

            if apply(&tx)? {
                tx.execute(
                    "UPDATE chats SET updated_at = ?1 WHERE id = ?2",
                    params![format_timestamp(&Utc::now()), chat_id],
                )?;
            }

            let chat = load_chat(&tx, chat_id)?.ok_or_else(|| DirectoryError::not_found("chat", chat_id))?;
            tx.commit()?;
            Ok(chat)
        })
    }
}

/// Canonical key for an unordered user pair.
fn direct_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}|{}", a, b)
    } else {
        format!("{}|{}", b, a)
    }
}

fn find_by_direct_key(conn: &Connection, key: &str) -> DirectoryResult<Option<Chat>> {
    let id: Option<ChatId> = conn
        .query_row("SELECT id FROM chats WHERE direct_key = ?1", [key], |row| row.get(0))
        .optional()?;
    match id {
        Some(id) => load_chat(conn, &id),
        None => Ok(None),
    }
}

fn load_chat(conn: &Connection, id: &str) -> DirectoryResult<Option<Chat>> {
    let sql = format!("SELECT {} FROM chats WHERE id = ?1", CHAT_COLUMNS);
    let Some(row) = conn.query_row(&sql, [id], ChatRow::from_row).optional()? else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT user_id FROM chat_participants WHERE chat_id = ?1 ORDER BY rowid",
    )?;
    let participant_ids = stmt
        .query_map([id], |r| r.get::<_, UserId>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(Chat {
        id: row.id,
        name: row.name,
        is_private: row.is_private,
        participant_ids,
        created_at: parse_timestamp(&row.created_at),
        updated_at: parse_timestamp(&row.updated_at),
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;
    use crate::identity::Identity;
    use crate::test_db;
    use murmur_types::models::{GENERAL_CHAT_ID, GENERAL_CHAT_NAME};

    fn setup() -> (Identity, Conversations) {
        let db = test_db();
        (Identity::new(db.clone()), Conversations::new(db))
    }

    #[test]
    fn broadcast_room_is_idempotent() {
        let (_, rooms) = setup();
        let first = rooms.ensure_broadcast_room(GENERAL_CHAT_ID, GENERAL_CHAT_NAME).unwrap();
        let second = rooms.ensure_broadcast_room(GENERAL_CHAT_ID, GENERAL_CHAT_NAME).unwrap();
        assert_eq!(first, second);
        assert!(first.is_open());
        assert!(rooms.get_room(GENERAL_CHAT_ID).unwrap().is_some());
    }

    #[test]
    fn direct_room_is_unique_per_pair() {
        let (identity, rooms) = setup();
        let a = identity.create_user("alice", "hunter22", false).unwrap();
        let b = identity.create_user("bob", "hunter22", false).unwrap();

        let first = rooms.create_direct_room(&a.id, &b.id).unwrap();
        let second = rooms.create_direct_room(&b.id, &a.id).unwrap();
        assert_eq!(first.id, second.id);
        assert!(first.is_private);
        assert_eq!(first.participant_ids, vec![a.id.clone(), b.id.clone()]);

        let found = rooms.find_direct_room(&b.id, &a.id).unwrap().unwrap();
        assert_eq!(found.id, first.id);

        let count: i64 = rooms
            .db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM chats WHERE is_private = 1", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn direct_room_validation() {
        let (identity, rooms) = setup();
        let a = identity.create_user("alice", "hunter22", false).unwrap();
        assert!(matches!(
            rooms.create_direct_room(&a.id, &a.id),
            Err(DirectoryError::Validation(_))
        ));
        assert!(matches!(
            rooms.create_direct_room(&a.id, "ghost"),
            Err(DirectoryError::NotFound { kind: "user", .. })
        ));
        assert!(rooms.find_direct_room(&a.id, "ghost").unwrap().is_none());
    }

    #[test]
    fn rooms_for_includes_open_and_own_rooms() {
        let (identity, rooms) = setup();
        rooms.ensure_broadcast_room(GENERAL_CHAT_ID, GENERAL_CHAT_NAME).unwrap();
        let a = identity.create_user("alice", "hunter22", false).unwrap();
        let b = identity.create_user("bob", "hunter22", false).unwrap();
        let c = identity.create_user("carol", "hunter22", false).unwrap();
        let ab = rooms.create_direct_room(&a.id, &b.id).unwrap();

        let for_a: Vec<_> = rooms.rooms_for(&a.id).unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(for_a, vec![ab.id.clone(), GENERAL_CHAT_ID.to_string()]);

        let for_c: Vec<_> = rooms.rooms_for(&c.id).unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(for_c, vec![GENERAL_CHAT_ID.to_string()]);
    }

    #[test]
    fn membership_changes_bump_updated_at() {
        let (identity, rooms) = setup();
        let general = rooms.ensure_broadcast_room(GENERAL_CHAT_ID, GENERAL_CHAT_NAME).unwrap();
        let a = identity.create_user("alice", "hunter22", false).unwrap();

        let added = rooms.add_participant(GENERAL_CHAT_ID, &a.id).unwrap();
        assert_eq!(added.participant_ids, vec![a.id.clone()]);
        assert!(added.updated_at >= general.updated_at);

        // Adding again is a no-op
        let again = rooms.add_participant(GENERAL_CHAT_ID, &a.id).unwrap();
        assert_eq!(again.updated_at, added.updated_at);

        let removed = rooms.remove_participant(GENERAL_CHAT_ID, &a.id).unwrap();
        assert!(removed.participant_ids.is_empty());
        assert!(removed.updated_at >= added.updated_at);
    }

    #[test]
    fn direct_room_membership_is_fixed() {
        let (identity, rooms) = setup();
        let a = identity.create_user("alice", "hunter22", false).unwrap();
        let b = identity.create_user("bob", "hunter22", false).unwrap();
        let c = identity.create_user("carol", "hunter22", false).unwrap();
        let ab = rooms.create_direct_room(&a.id, &b.id).unwrap();

        assert!(matches!(
            rooms.add_participant(&ab.id, &c.id),
            Err(DirectoryError::Validation(_))
        ));
        assert!(matches!(
            rooms.remove_participant("nope", &c.id),
            Err(DirectoryError::NotFound { kind: "chat", .. })
        ));
    }

    #[test]
    fn racing_direct_room_creation_yields_one_room() {
        let (identity, rooms) = setup();
        let a = identity.create_user("alice", "hunter22", false).unwrap();
        let b = identity.create_user("bob", "hunter22", false).unwrap();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let rooms = rooms.clone();
                let barrier = barrier.clone();
                let (first, second) = if i % 2 == 0 {
                    (a.id.clone(), b.id.clone())
                } else {
                    (b.id.clone(), a.id.clone())
                };
                std::thread::spawn(move || {
                    barrier.wait();
                    rooms.create_direct_room(&first, &second).unwrap().id
                })
            })
            .collect();
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|id| *id == ids[0]));

        let count: i64 = rooms
            .db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM chats WHERE direct_key IS NOT NULL", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
