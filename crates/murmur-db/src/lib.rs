pub mod conversations;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod migrations;
pub mod models;

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub use conversations::Conversations;
pub use error::{DirectoryError, DirectoryResult};
pub use identity::Identity;
pub use ledger::{Deletion, Ledger, NewMessage, ReactionToggle, ReadMark};

/// Storage shared by the identity, conversation and message directories.
///
/// A single connection behind a mutex: every directory operation runs inside
/// one lock acquisition, which is what makes read-check-write sequences atomic.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Durable store backed by a SQLite file.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let db = Self::init(conn)?;
        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Process-lifetime store; state is gone when the process exits.
    pub fn open_in_memory() -> Result<Self> {
        let db = Self::init(Connection::open_in_memory()?)?;
        info!("In-memory database opened");
        Ok(db)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> DirectoryResult<T>
    where
        F: FnOnce(&Connection) -> DirectoryResult<T>,
    {
        let conn = self.conn.lock().map_err(|_| DirectoryError::LockPoisoned)?;
        f(&conn)
    }

    /// Like `with_conn`, but hands out `&mut` so the closure can open a transaction.
    pub fn with_conn_mut<F, T>(&self, f: F) -> DirectoryResult<T>
    where
        F: FnOnce(&mut Connection) -> DirectoryResult<T>,
    {
        let mut conn = self.conn.lock().map_err(|_| DirectoryError::LockPoisoned)?;
        f(&mut conn)
    }
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> DirectoryResult<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> DirectoryResult<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_db() -> std::sync::Arc<Database> {
    std::sync::Arc::new(Database::open_in_memory().unwrap())
}
