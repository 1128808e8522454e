use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use murmur_db::{Conversations, Database, DirectoryResult, Identity, Ledger};
use murmur_types::events::{ClientEvent, ServerEvent};
use murmur_types::models::{ChannelId, Chat, GENERAL_CHAT_ID, GENERAL_CHAT_NAME, User, UserId};

use crate::channels::{ChannelTable, OUTBOUND_CAPACITY, Outbound, deliver};
use crate::error::{ProtocolError, ProtocolResult};
use crate::registry::ConnectionRegistry;
use crate::typing::TypingTracker;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a typing indicator lives without a refresh
    pub typing_timeout: Duration,
    pub outbound_capacity: usize,
    /// When set, `login` must carry a token signed with this secret whose
    /// subject is the user being logged in.
    pub login_token_secret: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            typing_timeout: Duration::from_secs(6),
            outbound_capacity: OUTBOUND_CAPACITY,
            login_token_secret: None,
        }
    }
}

/// Distribution engine: routes inbound channel events to the directories and
/// fans the resulting server events out to the right channels.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) identity: Identity,
    pub(crate) conversations: Conversations,
    pub(crate) ledger: Ledger,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) channels: RwLock<ChannelTable>,
    pub(crate) typing: Mutex<TypingTracker>,
    /// Held across each message write and its fan-out so every recipient sees
    /// one room's updates in commit order.
    pub(crate) publish: Mutex<()>,
    pub(crate) config: EngineConfig,
}

impl Engine {
    pub fn new(db: Arc<Database>, config: EngineConfig) -> DirectoryResult<Self> {
        let conversations = Conversations::new(db.clone());
        conversations.ensure_broadcast_room(GENERAL_CHAT_ID, GENERAL_CHAT_NAME)?;

        Ok(Self {
            inner: Arc::new(EngineInner {
                identity: Identity::new(db.clone()),
                conversations,
                ledger: Ledger::new(db),
                registry: ConnectionRegistry::new(),
                channels: RwLock::new(ChannelTable::default()),
                typing: Mutex::new(TypingTracker::new(config.typing_timeout)),
                publish: Mutex::new(()),
                config,
            }),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn conversations(&self) -> &Conversations {
        &self.inner.conversations
    }

    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Register a new channel and queue its `server.ack`. The receiver is
    /// the channel's outbound queue.
    pub async fn open_channel(&self) -> (ChannelId, mpsc::Receiver<Outbound>) {
        let channel_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.config.outbound_capacity);
        self.inner.channels.write().await.open(channel_id, tx);

        debug!("Channel {} opened", channel_id);
        self.send_to(
            channel_id,
            ServerEvent::Ack {
                channel_id,
                message: "Connected to chat server".into(),
            },
        )
        .await;

        (channel_id, rx)
    }

    /// Process one inbound event. Failures are reported to the channel as
    /// `server.error`; the channel stays open.
    pub async fn handle(&self, channel_id: ChannelId, event: ClientEvent) {
        let name = event.name();
        if let Err(err) = self.dispatch(channel_id, event).await {
            match &err {
                ProtocolError::Internal(detail) => {
                    error!("Channel {} {} failed: {}", channel_id, name, detail)
                }
                other => debug!("Channel {} {} rejected: {}", channel_id, name, other),
            }
            self.report_error(channel_id, err).await;
        }
    }

    pub async fn report_error(&self, channel_id: ChannelId, err: ProtocolError) {
        self.send_to(channel_id, err.to_event()).await;
    }

    /// Tear down a channel. If it still held its user's binding the user goes
    /// offline and their typing indicators are cleared.
    pub async fn close_channel(&self, channel_id: ChannelId) {
        let user_id = self.inner.channels.write().await.close(channel_id);
        match user_id {
            Some(user_id) => self.release(channel_id, &user_id).await,
            None => debug!("Channel {} closed before login", channel_id),
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.channels.read().await.len()
    }

    /// Drop stale typing indicators and tell the rooms. Returns how many expired.
    pub async fn expire_typing(&self) -> usize {
        let expired = self.inner.typing.lock().await.sweep(Instant::now());
        for (user_id, chat_id) in &expired {
            let origin = self.inner.registry.resolve(user_id).await;
            self.send_to_room_group(
                chat_id,
                ServerEvent::TypingStop {
                    user_id: user_id.clone(),
                    chat_id: chat_id.clone(),
                },
                origin,
            )
            .await;
        }
        expired.len()
    }

    async fn dispatch(&self, channel_id: ChannelId, event: ClientEvent) -> ProtocolResult<()> {
        if let ClientEvent::Login { user_id, token } = event {
            return self.login(channel_id, user_id, token).await;
        }

        let user_id = self
            .inner
            .channels
            .read()
            .await
            .user_of(channel_id)
            .cloned()
            .ok_or(ProtocolError::AuthenticationRequired)?;

        match event {
            ClientEvent::Login { .. } => Ok(()),
            ClientEvent::SendMessage {
                chat_id,
                content,
                reply_to,
            } => self.send_message(channel_id, &user_id, chat_id, content, reply_to).await,
            ClientEvent::JoinChat { chat_id } => self.join_chat(channel_id, &user_id, chat_id).await,
            ClientEvent::CreateDirectChat { other_user_id } => {
                self.create_direct_chat(channel_id, &user_id, other_user_id).await
            }
            ClientEvent::React { message_id, emoji } => self.react(&user_id, message_id, emoji).await,
            ClientEvent::MarkRead { message_id } => self.mark_read(&user_id, message_id).await,
            ClientEvent::DeleteMessage { message_id } => self.delete_message(&user_id, message_id).await,
            ClientEvent::Typing { chat_id } => self.typing(channel_id, &user_id, chat_id).await,
            ClientEvent::StopTyping { chat_id } => self.stop_typing(channel_id, &user_id, chat_id).await,
            ClientEvent::UpdatePreferences(patch) => {
                self.update_preferences(channel_id, &user_id, patch).await
            }
            ClientEvent::SearchMessages { query, chat_id } => {
                self.search_messages(channel_id, &user_id, query, chat_id).await
            }
            ClientEvent::GetThread { message_id } => self.thread(channel_id, &user_id, message_id).await,
            ClientEvent::GetStats => self.stats(channel_id).await,
            ClientEvent::GetUserInfo { user_id: target } => self.user_info(channel_id, target).await,
            ClientEvent::AdminCreateUser { username, password } => {
                self.admin_create_user(channel_id, &user_id, username, password).await
            }
            ClientEvent::AdminGetConnections => self.admin_connections(channel_id, &user_id).await,
        }
    }

    /// Give up `user_id`'s binding if `channel_id` still holds it.
    pub(crate) async fn release(&self, channel_id: ChannelId, user_id: &str) {
        if self.inner.registry.unbind(channel_id).await.is_none() {
            // A newer channel has taken over; leave presence alone
            debug!("Channel {} for {} was superseded, nothing to release", channel_id, user_id);
            return;
        }

        match self.inner.identity.set_presence(user_id, false) {
            Ok(user) => {
                if let Err(e) = self.broadcast_presence(&user).await {
                    warn!("Failed to broadcast presence for {}: {}", user_id, e);
                }
            }
            Err(e) => warn!("Failed to mark {} offline: {}", user_id, e),
        }

        let chats = self.inner.typing.lock().await.drop_user(user_id);
        for chat_id in chats {
            self.send_to_room_group(
                &chat_id,
                ServerEvent::TypingStop {
                    user_id: user_id.to_string(),
                    chat_id: chat_id.clone(),
                },
                None,
            )
            .await;
        }

        info!("User {} went offline", user_id);
    }

    /// `user.statusUpdate` and fresh `users.stats` to every channel.
    pub(crate) async fn broadcast_presence(&self, user: &User) -> ProtocolResult<()> {
        let stats = self.inner.identity.stats()?;
        self.broadcast(ServerEvent::StatusUpdate {
            user_id: user.id.clone(),
            presence: user.presence.clone(),
        })
        .await;
        self.broadcast(ServerEvent::Stats(stats)).await;
        Ok(())
    }

    pub(crate) async fn send_to(&self, channel_id: ChannelId, event: ServerEvent) {
        let event = Arc::new(event);
        let channels = self.inner.channels.read().await;
        match channels.sender(channel_id) {
            Some(tx) => {
                deliver(channel_id, tx, &event);
            }
            None => debug!("Channel {} gone, dropping event", channel_id),
        }
    }

    pub(crate) async fn send_to_user(&self, user_id: &str, event: ServerEvent) {
        if let Some(channel_id) = self.inner.registry.resolve(user_id).await {
            self.send_to(channel_id, event).await;
        }
    }

    pub(crate) async fn broadcast(&self, event: ServerEvent) {
        let event = Arc::new(event);
        let channels = self.inner.channels.read().await;
        for (channel_id, tx) in channels.all() {
            deliver(channel_id, tx, &event);
        }
    }

    /// Deliver a room event to its audience: the bound channel of every
    /// participant for a private room, the room group otherwise.
    pub(crate) async fn fan_out(&self, chat: &Chat, event: ServerEvent) {
        if !chat.is_private {
            self.send_to_room_group(&chat.id, event, None).await;
            return;
        }

        let mut targets = Vec::with_capacity(chat.participant_ids.len());
        for participant in &chat.participant_ids {
            if let Some(channel_id) = self.inner.registry.resolve(participant).await {
                targets.push(channel_id);
            }
        }

        let event = Arc::new(event);
        let channels = self.inner.channels.read().await;
        for channel_id in targets {
            if let Some(tx) = channels.sender(channel_id) {
                deliver(channel_id, tx, &event);
            }
        }
    }

    /// Every channel that joined the room group, minus `except`.
    pub(crate) async fn send_to_room_group(&self, chat_id: &str, event: ServerEvent, except: Option<ChannelId>) {
        let event = Arc::new(event);
        let channels = self.inner.channels.read().await;
        for (channel_id, tx) in channels.room_members(chat_id) {
            if Some(channel_id) != except {
                deliver(channel_id, tx, &event);
            }
        }
    }

    /// Look up a room. A missing general room is recreated on the spot and
    /// the caller is asked to retry.
    pub(crate) fn resolve_room(&self, chat_id: &str) -> ProtocolResult<Chat> {
        if let Some(chat) = self.inner.conversations.get_room(chat_id)? {
            return Ok(chat);
        }

        if chat_id == GENERAL_CHAT_ID {
            warn!("General room missing, recreating it");
            self.inner
                .conversations
                .ensure_broadcast_room(GENERAL_CHAT_ID, GENERAL_CHAT_NAME)?;
            return Err(ProtocolError::RoomRecovered(
                "General chat was missing and has been restored. Please try again.".into(),
            ));
        }

        Err(ProtocolError::NotFound("Chat not found".into()))
    }

    /// Admin rights are re-read from the directory on every request.
    pub(crate) fn require_admin(&self, user_id: &UserId) -> ProtocolResult<()> {
        if self.inner.identity.is_admin(user_id)? {
            Ok(())
        } else {
            Err(ProtocolError::Forbidden("Admin privileges required".into()))
        }
    }
}
