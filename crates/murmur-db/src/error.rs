use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Validation(String),

    #[error("username already exists: {0}")]
    UsernameTaken(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("storage lock poisoned")]
    LockPoisoned,

    #[error("credential error: {0}")]
    Crypto(#[from] anyhow::Error),
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;

impl DirectoryError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}
