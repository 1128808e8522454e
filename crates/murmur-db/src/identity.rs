use std::sync::Arc;

use chrono::Utc;
use rusqlite::{Connection, ErrorCode, params};
use tracing::info;
use uuid::Uuid;

use murmur_crypto::password::{hash_password, verify_password};
use murmur_types::models::{Preferences, PreferencesPatch, User, UserStats};

use crate::models::{USER_COLUMNS, UserRow, format_timestamp};
use crate::{Database, DirectoryError, DirectoryResult, OptionalExt};

pub const MIN_USERNAME_LEN: usize = 3;
pub const MAX_USERNAME_LEN: usize = 32;
pub const MIN_PASSWORD_LEN: usize = 6;

/// Identity directory: accounts, credentials, presence and preferences.
#[derive(Clone)]
pub struct Identity {
    db: Arc<Database>,
}

impl Identity {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Register an account. Usernames are unique; the check and the insert
    /// are backed by the `UNIQUE` constraint, so concurrent registrations of
    /// the same name cannot both succeed.
    pub fn create_user(&self, username: &str, password: &str, is_admin: bool) -> DirectoryResult<User> {
        let username = username.trim();
        validate_credentials(username, password)?;

        // Cheap early exit before paying for the hash
        if self.find_row_by_username(username)?.is_some() {
            return Err(DirectoryError::UsernameTaken(username.to_string()));
        }

        let password_hash = hash_password(password)?;
        let id = Uuid::new_v4().to_string();
        let now = format_timestamp(&Utc::now());

        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO users (id, username, password, is_admin, last_seen_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, username, password_hash, is_admin, now],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                    Err(DirectoryError::UsernameTaken(username.to_string()))
                }
                Err(e) => Err(e.into()),
            }
        })?;

        info!("Created user {} ({}){}", username, id, if is_admin { " [admin]" } else { "" });
        self.require(&id)
    }

    /// Verify credentials. Success also marks the user online.
    pub fn authenticate(&self, username: &str, password: &str) -> DirectoryResult<User> {
        let row = self
            .find_row_by_username(username.trim())?
            .ok_or(DirectoryError::InvalidCredentials)?;

        if !verify_password(password, &row.password)? {
            return Err(DirectoryError::InvalidCredentials);
        }

        self.set_presence(&row.id, true)
    }

    pub fn get(&self, id: &str) -> DirectoryResult<Option<User>> {
        Ok(self
            .db
            .with_conn(|conn| query_user_by_id(conn, id))?
            .map(UserRow::into_user))
    }

    /// Like `get`, but a missing user is an error.
    pub fn require(&self, id: &str) -> DirectoryResult<User> {
        self.get(id)?
            .ok_or_else(|| DirectoryError::not_found("user", id))
    }

    pub fn find_by_username(&self, username: &str) -> DirectoryResult<Option<User>> {
        Ok(self.find_row_by_username(username)?.map(UserRow::into_user))
    }

    pub fn is_admin(&self, id: &str) -> DirectoryResult<bool> {
        Ok(self.get(id)?.is_some_and(|u| u.is_admin))
    }

    /// Flip the online flag and stamp `lastSeenAt`.
    pub fn set_presence(&self, id: &str, online: bool) -> DirectoryResult<User> {
        let now = format_timestamp(&Utc::now());
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET online = ?1, last_seen_at = ?2 WHERE id = ?3",
                params![online, now, id],
            )?;
            if changed == 0 {
                return Err(DirectoryError::not_found("user", id));
            }
            Ok(())
        })?;
        self.require(id)
    }

    /// Merge a partial update into the stored preferences.
    pub fn update_preferences(&self, id: &str, patch: PreferencesPatch) -> DirectoryResult<Preferences> {
        self.db.with_conn(|conn| {
            let row = query_user_by_id(conn, id)?
                .ok_or_else(|| DirectoryError::not_found("user", id))?;

            let mut prefs = Preferences {
                theme: row.theme,
                notifications_enabled: row.notifications,
            };
            prefs.merge(patch);

            conn.execute(
                "UPDATE users SET theme = ?1, notifications = ?2 WHERE id = ?3",
                params![prefs.theme, prefs.notifications_enabled, id],
            )?;
            Ok(prefs)
        })
    }

    pub fn all_users(&self) -> DirectoryResult<Vec<User>> {
        self.query_users("1 = 1")
    }

    pub fn online_users(&self) -> DirectoryResult<Vec<User>> {
        self.query_users("online = 1")
    }

    pub fn stats(&self) -> DirectoryResult<UserStats> {
        let users = self.all_users()?;
        let online = users.iter().filter(|u| u.presence.online).count();
        Ok(UserStats {
            total: users.len(),
            online,
            offline: users.len() - online,
            users,
        })
    }

    /// Make sure an admin account with this username exists. An existing
    /// account is left untouched.
    pub fn ensure_admin(&self, username: &str, password: &str) -> DirectoryResult<User> {
        match self.find_by_username(username.trim())? {
            Some(user) => {
                info!("Admin bootstrap: user {} already exists", user.username);
                Ok(user)
            }
            None => self.create_user(username, password, true),
        }
    }

    /// Mark every user offline. Run at startup: no channel survives a restart.
    pub fn reset_presence(&self) -> DirectoryResult<usize> {
        self.db.with_conn(|conn| {
            Ok(conn.execute("UPDATE users SET online = 0 WHERE online = 1", [])?)
        })
    }

    fn find_row_by_username(&self, username: &str) -> DirectoryResult<Option<UserRow>> {
        self.db.with_conn(|conn| query_user_by_username(conn, username))
    }

    fn query_users(&self, filter: &str) -> DirectoryResult<Vec<User>> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM users WHERE {} ORDER BY created_at, username",
                USER_COLUMNS, filter
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], UserRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows.into_iter().map(UserRow::into_user).collect())
        })
    }
}

fn validate_credentials(username: &str, password: &str) -> DirectoryResult<()> {
    let len = username.chars().count();
    if !(MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&len) {
        return Err(DirectoryError::Validation(format!(
            "Username must be {}-{} characters",
            MIN_USERNAME_LEN, MAX_USERNAME_LEN
        )));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(DirectoryError::Validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

pub(crate) fn query_user_by_id(conn: &Connection, id: &str) -> DirectoryResult<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    conn.query_row(&sql, [id], UserRow::from_row).optional()
}

fn query_user_by_username(conn: &Connection, username: &str) -> DirectoryResult<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS);
    conn.query_row(&sql, [username], UserRow::from_row).optional()
}
