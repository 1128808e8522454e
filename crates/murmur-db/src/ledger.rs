use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{Connection, params, params_from_iter};
use tracing::debug;
use uuid::Uuid;

use murmur_types::models::{
    ChatId, DELETED_CONTENT, Message, MessageId, Reaction, SYSTEM_SENDER, UserId,
};

use crate::models::{
    MESSAGE_COLUMNS, MessageRow, ReactionRow, format_timestamp, parse_timestamp,
};
use crate::{Database, DirectoryError, DirectoryResult, OptionalExt};

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    /// Username at send time; kept even if the account is renamed later
    pub sender_name: Option<String>,
    pub content: String,
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone)]
pub struct ReactionToggle {
    /// `true` if the reaction was added, `false` if it was removed
    pub added: bool,
    pub message: Message,
}

#[derive(Debug, Clone)]
pub struct ReadMark {
    /// `false` when the user had already read the message
    pub changed: bool,
    pub message: Message,
}

#[derive(Debug, Clone)]
pub enum Deletion {
    Deleted(Message),
    AlreadyDeleted(Message),
}

/// Message ledger: message records, reactions, read receipts and deletion.
#[derive(Clone)]
pub struct Ledger {
    db: Arc<Database>,
}

impl Ledger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Persist a message. The sender is the first entry in `readBy`.
    pub fn create(&self, new: NewMessage) -> DirectoryResult<Message> {
        let id = Uuid::new_v4().to_string();

        self.db.with_conn_mut(|conn| {
            // Stamped under the lock so createdAt never runs backwards against seq
            let now = format_timestamp(&Utc::now());
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (id, chat_id, sender_id, sender_name, content, reply_to, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![id, new.chat_id, new.sender_id, new.sender_name, new.content, new.reply_to, now],
            )?;
            tx.execute(
                "INSERT INTO message_reads (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
                params![id, new.sender_id, now],
            )?;
            let message = load_message(&tx, &id)?.ok_or_else(|| DirectoryError::not_found("message", &id))?;
            tx.commit()?;

            debug!("Message {} stored in chat {}", id, message.chat_id);
            Ok(message)
        })
    }

    /// Server-authored message, e.g. a welcome note.
    pub fn create_system_message(&self, chat_id: &str, content: &str) -> DirectoryResult<Message> {
        self.create(NewMessage {
            chat_id: chat_id.to_string(),
            sender_id: SYSTEM_SENDER.to_string(),
            sender_name: None,
            content: content.to_string(),
            reply_to: None,
        })
    }

    /// Look up a message, including deleted ones.
    pub fn get(&self, id: &str) -> DirectoryResult<Option<Message>> {
        self.db.with_conn(|conn| load_message(conn, id))
    }

    /// Non-deleted messages of a room, oldest first.
    pub fn history(&self, chat_id: &str) -> DirectoryResult<Vec<Message>> {
        self.db.with_conn(|conn| {
            let rows = query_rows(conn, "chat_id = ?1 AND deleted = 0 ORDER BY seq ASC", [chat_id])?;
            hydrate(conn, rows)
        })
    }

    /// Non-deleted replies to a message, oldest first.
    pub fn thread(&self, parent_id: &str) -> DirectoryResult<Vec<Message>> {
        self.db.with_conn(|conn| {
            let rows = query_rows(conn, "reply_to = ?1 AND deleted = 0 ORDER BY seq ASC", [parent_id])?;
            hydrate(conn, rows)
        })
    }

    /// Add the (user, emoji) reaction, or remove it if already present.
    pub fn toggle_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> DirectoryResult<ReactionToggle> {
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            ensure_exists(&tx, message_id)?;

            let removed = tx.execute(
                "DELETE FROM message_reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                params![message_id, user_id, emoji],
            )?;
            let added = removed == 0;
            if added {
                tx.execute(
                    "INSERT INTO message_reactions (message_id, user_id, emoji, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![message_id, user_id, emoji, format_timestamp(&Utc::now())],
                )?;
            }

            let message = load_message(&tx, message_id)?
                .ok_or_else(|| DirectoryError::not_found("message", message_id))?;
            tx.commit()?;
            Ok(ReactionToggle { added, message })
        })
    }

    /// Record that `user_id` has read the message. Grow-only: repeating is a no-op.
    pub fn mark_read(&self, message_id: &str, user_id: &str) -> DirectoryResult<ReadMark> {
        self.db.with_conn(|conn| {
            ensure_exists(conn, message_id)?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
                params![message_id, user_id, format_timestamp(&Utc::now())],
            )?;
            let message = load_message(conn, message_id)?
                .ok_or_else(|| DirectoryError::not_found("message", message_id))?;
            Ok(ReadMark {
                changed: inserted == 1,
                message,
            })
        })
    }

    /// Replace the content with the tombstone. Only the sender may do this,
    /// and it cannot be undone.
    pub fn soft_delete(&self, message_id: &str, requester_id: &str) -> DirectoryResult<Deletion> {
        self.db.with_conn(|conn| {
            let message = load_message(conn, message_id)?
                .ok_or_else(|| DirectoryError::not_found("message", message_id))?;

            if message.sender_id != requester_id {
                return Err(DirectoryError::Forbidden(
                    "Only the sender can delete a message".into(),
                ));
            }
            if message.deleted {
                return Ok(Deletion::AlreadyDeleted(message));
            }

            conn.execute(
                "UPDATE messages SET content = ?1, deleted = 1, updated_at = ?2 WHERE id = ?3",
                params![DELETED_CONTENT, format_timestamp(&Utc::now()), message_id],
            )?;
            let message = load_message(conn, message_id)?
                .ok_or_else(|| DirectoryError::not_found("message", message_id))?;
            Ok(Deletion::Deleted(message))
        })
    }

    /// Case-insensitive substring search over non-deleted messages, newest first.
    pub fn search(&self, query: &str, chat_id: Option<&str>) -> DirectoryResult<Vec<Message>> {
        let needle = query.to_lowercase();
        self.db.with_conn(|conn| {
            let rows = match chat_id {
                Some(chat_id) => query_rows(conn, "deleted = 0 AND chat_id = ?1 ORDER BY seq DESC", [chat_id])?,
                None => query_rows(conn, "deleted = 0 ORDER BY seq DESC", [])?,
            };
            let matched = rows
                .into_iter()
                .filter(|row| row.content.to_lowercase().contains(&needle))
                .collect();
            hydrate(conn, matched)
        })
    }
}

fn ensure_exists(conn: &Connection, message_id: &str) -> DirectoryResult<()> {
    conn.query_row("SELECT 1 FROM messages WHERE id = ?1", [message_id], |_| Ok(()))
        .optional()?
        .ok_or_else(|| DirectoryError::not_found("message", message_id))
}

fn query_rows<P: rusqlite::Params>(conn: &Connection, tail: &str, params: P) -> DirectoryResult<Vec<MessageRow>> {
    let sql = format!("SELECT {} FROM messages WHERE {}", MESSAGE_COLUMNS, tail);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, MessageRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_message(conn: &Connection, id: &str) -> DirectoryResult<Option<Message>> {
    let rows = query_rows(conn, "id = ?1", [id])?;
    Ok(hydrate(conn, rows)?.pop())
}

/// Keeps every `IN (...)` list well under SQLite's bound-parameter limit.
const HYDRATE_CHUNK: usize = 500;

/// Attach reactions and read receipts to a batch of rows, keeping row order.
fn hydrate(conn: &Connection, rows: Vec<MessageRow>) -> DirectoryResult<Vec<Message>> {
    if rows.is_empty() {
        return Ok(vec![]);
    }

    let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
    let mut reactions: HashMap<String, Vec<Reaction>> = HashMap::new();
    let mut readers: HashMap<String, Vec<UserId>> = HashMap::new();

    for chunk in ids.chunks(HYDRATE_CHUNK) {
        let placeholders: Vec<String> = (1..=chunk.len()).map(|i| format!("?{}", i)).collect();
        let placeholders = placeholders.join(", ");

        let sql = format!(
            "SELECT message_id, user_id, emoji, created_at FROM message_reactions
             WHERE message_id IN ({}) ORDER BY rowid",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let reaction_rows = stmt
            .query_map(params_from_iter(chunk.iter()), |row| {
                Ok(ReactionRow {
                    message_id: row.get(0)?,
                    user_id: row.get(1)?,
                    emoji: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for r in reaction_rows {
            reactions.entry(r.message_id).or_default().push(Reaction {
                user_id: r.user_id,
                emoji: r.emoji,
                timestamp: parse_timestamp(&r.created_at),
            });
        }

        let sql = format!(
            "SELECT message_id, user_id FROM message_reads WHERE message_id IN ({}) ORDER BY rowid",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let read_rows = stmt
            .query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (message_id, user_id) in read_rows {
            readers.entry(message_id).or_default().push(user_id);
        }
    }

    Ok(rows
        .into_iter()
        .map(|row| Message {
            reactions: reactions.remove(&row.id).unwrap_or_default(),
            read_by: readers.remove(&row.id).unwrap_or_default(),
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
            id: row.id,
            chat_id: row.chat_id,
            sender_id: row.sender_id,
            sender_name: row.sender_name,
            content: row.content,
            reply_to: row.reply_to,
            deleted: row.deleted,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Barrier;

    use super::*;
    use crate::test_db;
    use murmur_types::models::GENERAL_CHAT_ID;

    fn msg(chat_id: &str, sender: &str, content: &str) -> NewMessage {
        NewMessage {
            chat_id: chat_id.into(),
            sender_id: sender.into(),
            sender_name: Some(sender.into()),
            content: content.into(),
            reply_to: None,
        }
    }

    #[test]
    fn create_then_history() {
        let ledger = Ledger::new(test_db());
        let sent = ledger.create(msg(GENERAL_CHAT_ID, "alice", "hello")).unwrap();
        assert_eq!(sent.read_by, vec!["alice".to_string()]);
        assert!(!sent.deleted);

        let history = ledger.history(GENERAL_CHAT_ID).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, sent.id);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[0].sender_id, "alice");
        assert!(ledger.history("other").unwrap().is_empty());
    }

    #[test]
    fn history_is_in_creation_order() {
        let ledger = Ledger::new(test_db());
        let ids: Vec<_> = (0..5)
            .map(|i| ledger.create(msg(GENERAL_CHAT_ID, "alice", &format!("m{}", i))).unwrap().id)
            .collect();
        let history: Vec<_> = ledger.history(GENERAL_CHAT_ID).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(history, ids);
    }

    #[test]
    fn reaction_toggle_is_symmetric() {
        let ledger = Ledger::new(test_db());
        let m = ledger.create(msg(GENERAL_CHAT_ID, "alice", "hello")).unwrap();

        let first = ledger.toggle_reaction(&m.id, "bob", "👍").unwrap();
        assert!(first.added);
        assert_eq!(first.message.reactions.len(), 1);
        assert_eq!(first.message.reactions[0].user_id, "bob");
        assert_eq!(first.message.reactions[0].emoji, "👍");

        // A different emoji from the same user is a separate reaction
        ledger.toggle_reaction(&m.id, "bob", "🎉").unwrap();

        let second = ledger.toggle_reaction(&m.id, "bob", "👍").unwrap();
        assert!(!second.added);
        assert!(!second.message.reactions.iter().any(|r| r.user_id == "bob" && r.emoji == "👍"));
        assert_eq!(second.message.reactions.len(), 1);
    }

    #[test]
    fn reaction_on_missing_message_is_not_found() {
        let ledger = Ledger::new(test_db());
        assert!(matches!(
            ledger.toggle_reaction("nope", "bob", "👍"),
            Err(DirectoryError::NotFound { kind: "message", .. })
        ));
    }

    #[test]
    fn read_receipts_only_grow() {
        let ledger = Ledger::new(test_db());
        let m = ledger.create(msg(GENERAL_CHAT_ID, "alice", "hello")).unwrap();

        let first = ledger.mark_read(&m.id, "bob").unwrap();
        assert!(first.changed);
        assert_eq!(first.message.read_by, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(first.message.read_count(), 1);

        let again = ledger.mark_read(&m.id, "bob").unwrap();
        assert!(!again.changed);
        assert_eq!(again.message.read_by, first.message.read_by);

        let own = ledger.mark_read(&m.id, "alice").unwrap();
        assert!(!own.changed);
    }

    #[test]
    fn soft_delete_rules() {
        let ledger = Ledger::new(test_db());
        let m = ledger.create(msg(GENERAL_CHAT_ID, "alice", "secret plans")).unwrap();

        assert!(matches!(
            ledger.soft_delete(&m.id, "bob"),
            Err(DirectoryError::Forbidden(_))
        ));
        assert_eq!(ledger.get(&m.id).unwrap().unwrap().content, "secret plans");

        match ledger.soft_delete(&m.id, "alice").unwrap() {
            Deletion::Deleted(deleted) => {
                assert!(deleted.deleted);
                assert_eq!(deleted.content, DELETED_CONTENT);
            }
            other => panic!("expected Deleted, got {:?}", other),
        }
        assert!(matches!(
            ledger.soft_delete(&m.id, "alice").unwrap(),
            Deletion::AlreadyDeleted(_)
        ));
        assert!(matches!(
            ledger.soft_delete(&m.id, "bob"),
            Err(DirectoryError::Forbidden(_))
        ));
        assert!(ledger.history(GENERAL_CHAT_ID).unwrap().is_empty());
        assert!(matches!(
            ledger.soft_delete("nope", "alice"),
            Err(DirectoryError::NotFound { .. })
        ));
    }

    #[test]
    fn search_is_case_insensitive_and_newest_first() {
        let ledger = Ledger::new(test_db());
        let first = ledger.create(msg(GENERAL_CHAT_ID, "alice", "Hello World")).unwrap();
        ledger.create(msg(GENERAL_CHAT_ID, "alice", "unrelated")).unwrap();
        let third = ledger.create(msg("dm", "bob", "say HELLO")).unwrap();
        let gone = ledger.create(msg(GENERAL_CHAT_ID, "alice", "hello again")).unwrap();
        ledger.soft_delete(&gone.id, "alice").unwrap();

        let all: Vec<_> = ledger.search("hello", None).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(all, vec![third.id.clone(), first.id.clone()]);

        let scoped: Vec<_> = ledger
            .search("HELLO", Some(GENERAL_CHAT_ID))
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(scoped, vec![first.id]);
    }

    #[test]
    fn thread_lists_replies() {
        let ledger = Ledger::new(test_db());
        let parent = ledger.create(msg(GENERAL_CHAT_ID, "alice", "question?")).unwrap();
        let mut reply = msg(GENERAL_CHAT_ID, "bob", "answer");
        reply.reply_to = Some(parent.id.clone());
        let reply = ledger.create(reply).unwrap();
        ledger.create(msg(GENERAL_CHAT_ID, "carol", "noise")).unwrap();

        let thread = ledger.thread(&parent.id).unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].id, reply.id);
        assert_eq!(thread[0].reply_to.as_deref(), Some(parent.id.as_str()));
    }

    #[test]
    fn system_messages_use_the_reserved_sender() {
        let ledger = Ledger::new(test_db());
        let welcome = ledger.create_system_message(GENERAL_CHAT_ID, "Welcome!").unwrap();
        assert_eq!(welcome.sender_id, SYSTEM_SENDER);
        assert_eq!(welcome.read_count(), 0);
    }

    #[test]
    fn history_and_search_handle_more_rows_than_sqlite_bind_limit() {
        const ROWS: usize = 33_000;
        let db = test_db();
        let ledger = Ledger::new(db.clone());
        let now = format_timestamp(&Utc::now());

        db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO messages (id, chat_id, sender_id, sender_name, content, created_at, updated_at)
                     VALUES (?1, ?2, 'alice', 'alice', 'hi there', ?3, ?3)",
                )?;
                for i in 0..ROWS {
                    insert.execute(params![format!("m{}", i), GENERAL_CHAT_ID, now])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .unwrap();
        let late = format!("m{}", ROWS - 7);
        ledger.toggle_reaction(&late, "bob", "👍").unwrap();

        let history = ledger.history(GENERAL_CHAT_ID).unwrap();
        assert_eq!(history.len(), ROWS);
        assert_eq!(history[0].id, "m0");
        let reacted = history.iter().find(|m| m.id == late).unwrap();
        assert_eq!(reacted.reactions.len(), 1);
        assert_eq!(reacted.reactions[0].user_id, "bob");

        let found = ledger.search("hi", None).unwrap();
        assert_eq!(found.len(), ROWS);
        assert_eq!(found[0].id, format!("m{}", ROWS - 1));
    }

    #[test]
    fn concurrent_creates_get_unique_ids_and_ordered_timestamps() {
        let ledger = Ledger::new(test_db());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let sender = format!("user{}", t);
                        ledger
                            .create(msg(GENERAL_CHAT_ID, &sender, &format!("{} {}", sender, i)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let history = ledger.history(GENERAL_CHAT_ID).unwrap();
        assert_eq!(history.len(), 200);
        let ids: HashSet<_> = history.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids.len(), 200);
        assert!(history.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn concurrent_reactions_and_reads_are_not_lost() {
        let ledger = Ledger::new(test_db());
        let target = ledger.create(msg(GENERAL_CHAT_ID, "alice", "vote here")).unwrap();
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let ledger = ledger.clone();
                let barrier = barrier.clone();
                let id = target.id.clone();
                std::thread::spawn(move || {
                    let user = format!("voter{}", i);
                    barrier.wait();
                    assert!(ledger.toggle_reaction(&id, &user, "👍").unwrap().added);
                    assert!(ledger.mark_read(&id, &user).unwrap().changed);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stored = ledger.history(GENERAL_CHAT_ID).unwrap().pop().unwrap();
        assert_eq!(stored.reactions.len(), 16);
        assert_eq!(stored.read_count(), 16);
    }
}
