use serde::{Deserialize, Serialize};

use crate::models::{
    ChannelId, Chat, ChatId, ConnectionInfo, Message, MessageId, Preferences, PreferencesPatch,
    Presence, Reaction, User, UserId, UserStats,
};

/// Events sent FROM a client TO the server over a channel.
///
/// Wire shape: `{"event": "<name>", "data": {...}}`. Required string fields
/// default to empty when missing so the router can report a validation error
/// instead of dropping the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Bind this channel to a user
    #[serde(rename = "login")]
    Login {
        #[serde(default)]
        user_id: UserId,
        #[serde(default)]
        token: Option<String>,
    },

    #[serde(rename = "message.send")]
    SendMessage {
        #[serde(default)]
        chat_id: ChatId,
        #[serde(default)]
        content: String,
        #[serde(default)]
        reply_to: Option<MessageId>,
    },

    #[serde(rename = "chat.join")]
    JoinChat {
        #[serde(default)]
        chat_id: ChatId,
    },

    #[serde(rename = "chat.createDirect")]
    CreateDirectChat {
        #[serde(default)]
        other_user_id: UserId,
    },

    #[serde(rename = "message.react")]
    React {
        #[serde(default)]
        message_id: MessageId,
        #[serde(default)]
        emoji: String,
    },

    #[serde(rename = "message.read")]
    MarkRead {
        #[serde(default)]
        message_id: MessageId,
    },

    #[serde(rename = "message.delete")]
    DeleteMessage {
        #[serde(default)]
        message_id: MessageId,
    },

    #[serde(rename = "user.typing")]
    Typing {
        #[serde(default)]
        chat_id: ChatId,
    },

    #[serde(rename = "user.stopTyping")]
    StopTyping {
        #[serde(default)]
        chat_id: ChatId,
    },

    #[serde(rename = "user.updatePreferences")]
    UpdatePreferences(PreferencesPatch),

    #[serde(rename = "messages.search")]
    SearchMessages {
        #[serde(default)]
        query: String,
        #[serde(default)]
        chat_id: Option<ChatId>,
    },

    /// Replies to a message
    #[serde(rename = "messages.thread")]
    GetThread {
        #[serde(default)]
        message_id: MessageId,
    },

    #[serde(rename = "users.getStats")]
    GetStats,

    #[serde(rename = "user.getInfo")]
    GetUserInfo {
        #[serde(default)]
        user_id: UserId,
    },

    #[serde(rename = "admin.createUser")]
    AdminCreateUser {
        #[serde(default)]
        username: String,
        #[serde(default)]
        password: String,
    },

    #[serde(rename = "admin.getConnections")]
    AdminGetConnections,
}

impl ClientEvent {
    /// Wire name of the event, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Login { .. } => "login",
            Self::SendMessage { .. } => "message.send",
            Self::JoinChat { .. } => "chat.join",
            Self::CreateDirectChat { .. } => "chat.createDirect",
            Self::React { .. } => "message.react",
            Self::MarkRead { .. } => "message.read",
            Self::DeleteMessage { .. } => "message.delete",
            Self::Typing { .. } => "user.typing",
            Self::StopTyping { .. } => "user.stopTyping",
            Self::UpdatePreferences(_) => "user.updatePreferences",
            Self::SearchMessages { .. } => "messages.search",
            Self::GetThread { .. } => "messages.thread",
            Self::GetStats => "users.getStats",
            Self::GetUserInfo { .. } => "user.getInfo",
            Self::AdminCreateUser { .. } => "admin.createUser",
            Self::AdminGetConnections => "admin.getConnections",
        }
    }
}

/// Machine-readable category attached to every `server.error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthenticationRequired,
    NotFound,
    Forbidden,
    ValidationError,
    DuplicateResource,
    InvalidCredentials,
    /// The request hit a transient condition the server repaired; resend it.
    Retry,
    Internal,
}

/// Events sent FROM the server TO a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Sent as soon as a channel opens
    #[serde(rename = "server.ack")]
    Ack { channel_id: ChannelId, message: String },

    #[serde(rename = "server.error")]
    Error { message: String, code: ErrorCode },

    /// Login succeeded; carries the caller's own profile
    #[serde(rename = "session.ready")]
    Ready { user: User },

    #[serde(rename = "users.online")]
    OnlineUsers(Vec<User>),

    #[serde(rename = "users.stats")]
    Stats(UserStats),

    #[serde(rename = "user.statusUpdate")]
    StatusUpdate { user_id: UserId, presence: Presence },

    #[serde(rename = "user.info")]
    UserInfo(User),

    #[serde(rename = "user.preferencesUpdated")]
    PreferencesUpdated(Preferences),

    #[serde(rename = "chats.list")]
    ChatList(Vec<Chat>),

    #[serde(rename = "chat.new")]
    ChatCreated(Chat),

    #[serde(rename = "chat.history")]
    History {
        chat_id: ChatId,
        messages: Vec<Message>,
    },

    #[serde(rename = "message.new")]
    MessageNew(Message),

    /// Acknowledges a send to its author
    #[serde(rename = "message.sent")]
    MessageSent { message_id: MessageId },

    #[serde(rename = "message.reactionUpdate")]
    ReactionUpdate {
        message_id: MessageId,
        chat_id: ChatId,
        reactions: Vec<Reaction>,
    },

    #[serde(rename = "message.readUpdate")]
    ReadUpdate {
        message_id: MessageId,
        chat_id: ChatId,
        read_by: Vec<UserId>,
        read_count: usize,
    },

    #[serde(rename = "message.deleted")]
    Deleted {
        message_id: MessageId,
        chat_id: ChatId,
        updated_content: String,
    },

    #[serde(rename = "user.typingStart")]
    TypingStart { user_id: UserId, chat_id: ChatId },

    #[serde(rename = "user.typingStop")]
    TypingStop { user_id: UserId, chat_id: ChatId },

    #[serde(rename = "messages.searchResults")]
    SearchResults(Vec<Message>),

    #[serde(rename = "messages.thread")]
    Thread {
        message_id: MessageId,
        messages: Vec<Message>,
    },

    #[serde(rename = "admin.userCreated")]
    AdminUserCreated(User),

    #[serde(rename = "admin.connections")]
    Connections(Vec<ConnectionInfo>),
}
