use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info};

use murmur_db::{Deletion, NewMessage};
use murmur_types::events::ServerEvent;
use murmur_types::models::{
    ChannelId, Chat, ChatId, ConnectionInfo, GENERAL_CHAT_ID, GENERAL_CHAT_NAME, Message,
    MessageId, PreferencesPatch, User, UserId,
};

use crate::engine::Engine;
use crate::error::{ProtocolError, ProtocolResult};

fn require_field(value: &str, message: &str) -> ProtocolResult<()> {
    if value.trim().is_empty() {
        Err(ProtocolError::validation(message))
    } else {
        Ok(())
    }
}

fn ensure_admitted(chat: &Chat, user_id: &str) -> ProtocolResult<()> {
    if chat.admits(user_id) {
        Ok(())
    } else {
        Err(ProtocolError::Forbidden("You are not a member of this chat".into()))
    }
}

impl Engine {
    pub(crate) async fn login(&self, channel_id: ChannelId, user_id: UserId, token: Option<String>) -> ProtocolResult<()> {
        let user_id = user_id.trim().to_string();
        require_field(&user_id, "Invalid user ID")?;

        if let Some(secret) = &self.inner.config.login_token_secret {
            let token = token.ok_or(ProtocolError::AuthenticationRequired)?;
            let claims = murmur_crypto::token::verify_token(secret, &token)
                .map_err(|_| ProtocolError::AuthenticationRequired)?;
            if claims.sub != user_id {
                return Err(ProtocolError::Forbidden("Token does not match user".into()));
            }
        }

        let user = self
            .inner
            .identity
            .get(&user_id)?
            .ok_or_else(|| ProtocolError::NotFound("User not found".into()))?;

        // Everything fallible that does not depend on the binding runs first
        let general = self
            .inner
            .conversations
            .ensure_broadcast_room(GENERAL_CHAT_ID, GENERAL_CHAT_NAME)?;
        let rooms = self.inner.conversations.rooms_for(&user.id)?;
        let history = self.inner.ledger.history(&general.id)?;

        let previous_user = self.inner.channels.write().await.set_user(channel_id, &user.id);
        if let Some(previous_user) = previous_user.filter(|prev| *prev != user.id) {
            self.release(channel_id, &previous_user).await;
        }
        if let Some(superseded) = self.inner.registry.bind(&user.id, channel_id).await {
            info!("{} moved from channel {} to {}", user.username, superseded, channel_id);
        }

        let (user, online) = match self.go_online(&user.id).await {
            Ok(ready) => ready,
            Err(e) => {
                self.inner.channels.write().await.clear_user(channel_id);
                self.release(channel_id, &user.id).await;
                return Err(e);
            }
        };
        info!("{} ({}) logged in on channel {}", user.username, user.id, channel_id);
        self.inner.channels.write().await.join(channel_id, &general.id);

        self.send_to(channel_id, ServerEvent::Ready { user }).await;
        self.send_to(channel_id, ServerEvent::OnlineUsers(online)).await;
        self.send_to(channel_id, ServerEvent::ChatList(rooms)).await;
        self.send_to(
            channel_id,
            ServerEvent::History {
                chat_id: general.id,
                messages: history,
            },
        )
        .await;
        Ok(())
    }

    /// Mark the user online and announce it. Returns the fresh record and online list.
    async fn go_online(&self, user_id: &str) -> ProtocolResult<(User, Vec<User>)> {
        let user = self.inner.identity.set_presence(user_id, true)?;
        self.broadcast_presence(&user).await?;
        let online = self.inner.identity.online_users()?;
        Ok((user, online))
    }

    pub(crate) async fn send_message(
        &self,
        channel_id: ChannelId,
        user_id: &UserId,
        chat_id: ChatId,
        content: String,
        reply_to: Option<MessageId>,
    ) -> ProtocolResult<()> {
        require_field(&chat_id, "Chat ID is required")?;
        require_field(&content, "Message content cannot be empty")?;

        let chat = self.resolve_room(&chat_id)?;
        ensure_admitted(&chat, user_id)?;

        let reply_to = reply_to.filter(|id| !id.trim().is_empty());
        if let Some(parent_id) = &reply_to {
            let in_room = self
                .inner
                .ledger
                .get(parent_id)?
                .is_some_and(|parent| parent.chat_id == chat.id);
            if !in_room {
                return Err(ProtocolError::NotFound("Message not found".into()));
            }
        }

        let sender_name = self.inner.identity.get(user_id)?.map(|u| u.username);

        let message_id = {
            let _order = self.inner.publish.lock().await;
            let message = self.inner.ledger.create(NewMessage {
                chat_id: chat.id.clone(),
                sender_id: user_id.clone(),
                sender_name,
                content,
                reply_to,
            })?;
            let message_id = message.id.clone();
            self.fan_out(&chat, ServerEvent::MessageNew(message)).await;
            message_id
        };

        self.send_to(channel_id, ServerEvent::MessageSent { message_id }).await;
        Ok(())
    }

    pub(crate) async fn join_chat(&self, channel_id: ChannelId, user_id: &UserId, chat_id: ChatId) -> ProtocolResult<()> {
        require_field(&chat_id, "Chat ID is required")?;
        let chat = self.resolve_room(&chat_id)?;
        ensure_admitted(&chat, user_id)?;

        self.inner.channels.write().await.join(channel_id, &chat.id);
        let messages = self.inner.ledger.history(&chat.id)?;
        debug!("Channel {} joined chat {}", channel_id, chat.id);

        self.send_to(
            channel_id,
            ServerEvent::History {
                chat_id: chat.id.clone(),
                messages,
            },
        )
        .await;

        let typists = self
            .inner
            .typing
            .lock()
            .await
            .who_is_typing(&chat.id, Instant::now());
        for typist in typists.into_iter().filter(|t| t != user_id) {
            self.send_to(
                channel_id,
                ServerEvent::TypingStart {
                    user_id: typist,
                    chat_id: chat.id.clone(),
                },
            )
            .await;
        }
        Ok(())
    }

    pub(crate) async fn create_direct_chat(
        &self,
        channel_id: ChannelId,
        user_id: &UserId,
        other_user_id: UserId,
    ) -> ProtocolResult<()> {
        require_field(&other_user_id, "Other user ID is required")?;
        let chat = self.inner.conversations.create_direct_room(user_id, &other_user_id)?;

        self.send_to(channel_id, ServerEvent::ChatCreated(chat.clone())).await;
        self.send_to_user(&other_user_id, ServerEvent::ChatCreated(chat)).await;
        Ok(())
    }

    /// Resolve a message and the room that owns it, checking the caller may see it.
    fn message_in_reach(&self, user_id: &str, message_id: &str) -> ProtocolResult<(Message, Chat)> {
        require_field(message_id, "Message ID is required")?;
        let message = self
            .inner
            .ledger
            .get(message_id)?
            .ok_or_else(|| ProtocolError::NotFound("Message not found".into()))?;
        let chat = self.resolve_room(&message.chat_id)?;
        ensure_admitted(&chat, user_id)?;
        Ok((message, chat))
    }

    pub(crate) async fn react(&self, user_id: &UserId, message_id: MessageId, emoji: String) -> ProtocolResult<()> {
        require_field(&emoji, "Emoji is required")?;
        let (_, chat) = self.message_in_reach(user_id, &message_id)?;

        // Held through fan-out so listeners see updates in commit order
        let _order = self.inner.publish.lock().await;
        let toggle = self.inner.ledger.toggle_reaction(&message_id, user_id, emoji.trim())?;
        debug!(
            "{} {} reaction {} on {}",
            user_id,
            if toggle.added { "added" } else { "removed" },
            emoji.trim(),
            message_id
        );

        self.fan_out(
            &chat,
            ServerEvent::ReactionUpdate {
                message_id,
                chat_id: chat.id.clone(),
                reactions: toggle.message.reactions,
            },
        )
        .await;
        Ok(())
    }

    pub(crate) async fn mark_read(&self, user_id: &UserId, message_id: MessageId) -> ProtocolResult<()> {
        let (_, chat) = self.message_in_reach(user_id, &message_id)?;

        let _order = self.inner.publish.lock().await;
        let mark = self.inner.ledger.mark_read(&message_id, user_id)?;
        if !mark.changed {
            return Ok(());
        }

        let read_count = mark.message.read_count();
        self.fan_out(
            &chat,
            ServerEvent::ReadUpdate {
                message_id,
                chat_id: chat.id.clone(),
                read_by: mark.message.read_by,
                read_count,
            },
        )
        .await;
        Ok(())
    }

    pub(crate) async fn delete_message(&self, user_id: &UserId, message_id: MessageId) -> ProtocolResult<()> {
        let (_, chat) = self.message_in_reach(user_id, &message_id)?;

        let _order = self.inner.publish.lock().await;
        match self.inner.ledger.soft_delete(&message_id, user_id)? {
            Deletion::Deleted(message) => {
                info!("{} deleted message {}", user_id, message_id);
                self.fan_out(
                    &chat,
                    ServerEvent::Deleted {
                        message_id,
                        chat_id: chat.id.clone(),
                        updated_content: message.content,
                    },
                )
                .await;
            }
            Deletion::AlreadyDeleted(_) => debug!("Message {} already deleted", message_id),
        }
        Ok(())
    }

    pub(crate) async fn typing(&self, channel_id: ChannelId, user_id: &UserId, chat_id: ChatId) -> ProtocolResult<()> {
        require_field(&chat_id, "Chat ID is required")?;
        let chat = self.resolve_room(&chat_id)?;
        ensure_admitted(&chat, user_id)?;

        self.inner
            .typing
            .lock()
            .await
            .start(user_id, &chat.id, Instant::now());
        self.send_to_room_group(
            &chat.id,
            ServerEvent::TypingStart {
                user_id: user_id.clone(),
                chat_id: chat.id.clone(),
            },
            Some(channel_id),
        )
        .await;
        Ok(())
    }

    pub(crate) async fn stop_typing(&self, channel_id: ChannelId, user_id: &UserId, chat_id: ChatId) -> ProtocolResult<()> {
        require_field(&chat_id, "Chat ID is required")?;

        let was_typing = self.inner.typing.lock().await.stop(user_id, &chat_id);
        if was_typing {
            self.send_to_room_group(
                &chat_id,
                ServerEvent::TypingStop {
                    user_id: user_id.clone(),
                    chat_id: chat_id.clone(),
                },
                Some(channel_id),
            )
            .await;
        }
        Ok(())
    }

    pub(crate) async fn update_preferences(
        &self,
        channel_id: ChannelId,
        user_id: &UserId,
        patch: PreferencesPatch,
    ) -> ProtocolResult<()> {
        let prefs = self.inner.identity.update_preferences(user_id, patch)?;
        self.send_to(channel_id, ServerEvent::PreferencesUpdated(prefs)).await;
        Ok(())
    }

    pub(crate) async fn search_messages(
        &self,
        channel_id: ChannelId,
        user_id: &UserId,
        query: String,
        chat_id: Option<ChatId>,
    ) -> ProtocolResult<()> {
        require_field(&query, "Search query is required")?;
        let query = query.trim();

        let results = match chat_id.filter(|id| !id.trim().is_empty()) {
            Some(chat_id) => {
                let chat = self.resolve_room(&chat_id)?;
                ensure_admitted(&chat, user_id)?;
                self.inner.ledger.search(query, Some(&chat.id))?
            }
            None => {
                let mut admitted: HashMap<ChatId, bool> = HashMap::new();
                let mut visible = Vec::new();
                for message in self.inner.ledger.search(query, None)? {
                    let allowed = match admitted.get(&message.chat_id) {
                        Some(allowed) => *allowed,
                        None => {
                            let allowed = self
                                .inner
                                .conversations
                                .get_room(&message.chat_id)?
                                .is_some_and(|chat| chat.admits(user_id));
                            admitted.insert(message.chat_id.clone(), allowed);
                            allowed
                        }
                    };
                    if allowed {
                        visible.push(message);
                    }
                }
                visible
            }
        };

        self.send_to(channel_id, ServerEvent::SearchResults(results)).await;
        Ok(())
    }

    pub(crate) async fn thread(&self, channel_id: ChannelId, user_id: &UserId, message_id: MessageId) -> ProtocolResult<()> {
        let (parent, _) = self.message_in_reach(user_id, &message_id)?;
        let messages = self.inner.ledger.thread(&parent.id)?;
        self.send_to(
            channel_id,
            ServerEvent::Thread {
                message_id: parent.id,
                messages,
            },
        )
        .await;
        Ok(())
    }

    pub(crate) async fn stats(&self, channel_id: ChannelId) -> ProtocolResult<()> {
        let stats = self.inner.identity.stats()?;
        self.send_to(channel_id, ServerEvent::Stats(stats)).await;
        Ok(())
    }

    pub(crate) async fn user_info(&self, channel_id: ChannelId, target: UserId) -> ProtocolResult<()> {
        require_field(&target, "User ID is required")?;
        let user = self.inner.identity.require(target.trim())?;
        self.send_to(channel_id, ServerEvent::UserInfo(user)).await;
        Ok(())
    }

    pub(crate) async fn admin_create_user(
        &self,
        channel_id: ChannelId,
        user_id: &UserId,
        username: String,
        password: String,
    ) -> ProtocolResult<()> {
        self.require_admin(user_id)?;

        // Password hashing is CPU-bound
        let identity = self.inner.identity.clone();
        let user = tokio::task::spawn_blocking(move || identity.create_user(&username, &password, false))
            .await
            .map_err(|e| ProtocolError::Internal(format!("user creation task failed: {}", e)))??;

        info!("Admin {} created user {} ({})", user_id, user.username, user.id);
        self.send_to(channel_id, ServerEvent::AdminUserCreated(user)).await;
        Ok(())
    }

    pub(crate) async fn admin_connections(&self, channel_id: ChannelId, user_id: &UserId) -> ProtocolResult<()> {
        self.require_admin(user_id)?;

        let mut connections = Vec::new();
        for (bound_user, bound_channel) in self.inner.registry.snapshot().await {
            let username = self.inner.identity.get(&bound_user)?.map(|u| u.username);
            connections.push(ConnectionInfo {
                user_id: bound_user,
                username,
                channel_id: bound_channel,
            });
        }

        self.send_to(channel_id, ServerEvent::Connections(connections)).await;
        Ok(())
    }
}
