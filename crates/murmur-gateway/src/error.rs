use thiserror::Error;

use murmur_db::DirectoryError;
use murmur_types::events::{ErrorCode, ServerEvent};

/// Recoverable protocol errors. Each one is reported to the originating
/// channel as `server.error`; none of them closes the channel.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Not authenticated")]
    AuthenticationRequired,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Duplicate(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The general room was missing and has been recreated; the client should resend.
    #[error("{0}")]
    RoomRecovered(String),

    /// Details are logged, never sent to the client.
    #[error("Internal server error")]
    Internal(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AuthenticationRequired => ErrorCode::AuthenticationRequired,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::Duplicate(_) => ErrorCode::DuplicateResource,
            Self::InvalidCredentials => ErrorCode::InvalidCredentials,
            Self::RoomRecovered(_) => ErrorCode::Retry,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::Error {
            message: self.to_string(),
            code: self.code(),
        }
    }

    pub(crate) fn validation(message: &str) -> Self {
        Self::Validation(message.to_string())
    }
}

impl From<DirectoryError> for ProtocolError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::NotFound { kind, .. } => Self::NotFound(match kind {
                "chat" => "Chat not found".into(),
                "message" => "Message not found".into(),
                "user" => "User not found".into(),
                other => format!("{} not found", other),
            }),
            DirectoryError::Forbidden(message) => Self::Forbidden(message),
            DirectoryError::Validation(message) => Self::Validation(message),
            DirectoryError::UsernameTaken(_) => Self::Duplicate("Username already exists".into()),
            DirectoryError::InvalidCredentials => Self::InvalidCredentials,
            other @ (DirectoryError::Storage(_)
            | DirectoryError::LockPoisoned
            | DirectoryError::Crypto(_)) => Self::Internal(other.to_string()),
        }
    }
}
