use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

use murmur_types::events::ServerEvent;
use murmur_types::models::{ChannelId, ChatId, UserId};

/// Events are shared between every recipient of a fan-out.
pub type Outbound = Arc<ServerEvent>;

/// Per-channel outbound queue depth. A channel that falls this far behind
/// starts losing events rather than stalling everyone else.
pub const OUTBOUND_CAPACITY: usize = 256;

struct ChannelState {
    tx: mpsc::Sender<Outbound>,
    user_id: Option<UserId>,
    /// Room groups this channel has joined
    rooms: HashSet<ChatId>,
}

/// Every open channel: its outbound queue, the user it carries and the
/// room groups it joined.
#[derive(Default)]
pub struct ChannelTable {
    channels: HashMap<ChannelId, ChannelState>,
}

impl ChannelTable {
    pub fn open(&mut self, channel_id: ChannelId, tx: mpsc::Sender<Outbound>) {
        self.channels.insert(
            channel_id,
            ChannelState {
                tx,
                user_id: None,
                rooms: HashSet::new(),
            },
        );
    }

    /// Forget a channel. Returns the user it carried, if any.
    pub fn close(&mut self, channel_id: ChannelId) -> Option<UserId> {
        self.channels.remove(&channel_id)?.user_id
    }

    pub fn user_of(&self, channel_id: ChannelId) -> Option<&UserId> {
        self.channels.get(&channel_id)?.user_id.as_ref()
    }

    /// Attach a user to the channel. Returns the user it carried before.
    pub fn set_user(&mut self, channel_id: ChannelId, user_id: &str) -> Option<UserId> {
        let state = self.channels.get_mut(&channel_id)?;
        state.user_id.replace(user_id.to_string())
    }

    /// Detach the channel's user, leaving it open but unauthenticated.
    pub fn clear_user(&mut self, channel_id: ChannelId) -> Option<UserId> {
        self.channels.get_mut(&channel_id)?.user_id.take()
    }

    /// Returns true if the channel was not already in the group.
    pub fn join(&mut self, channel_id: ChannelId, chat_id: &str) -> bool {
        self.channels
            .get_mut(&channel_id)
            .is_some_and(|state| state.rooms.insert(chat_id.to_string()))
    }

    pub fn sender(&self, channel_id: ChannelId) -> Option<&mpsc::Sender<Outbound>> {
        self.channels.get(&channel_id).map(|state| &state.tx)
    }

    /// Channels that joined the room group of `chat_id`.
    pub fn room_members<'a>(
        &'a self,
        chat_id: &'a str,
    ) -> impl Iterator<Item = (ChannelId, &'a mpsc::Sender<Outbound>)> + 'a {
        self.channels
            .iter()
            .filter(move |(_, state)| state.rooms.contains(chat_id))
            .map(|(id, state)| (*id, &state.tx))
    }

    pub fn all(&self) -> impl Iterator<Item = (ChannelId, &mpsc::Sender<Outbound>)> {
        self.channels.iter().map(|(id, state)| (*id, &state.tx))
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Queue an event without waiting. Returns false if it was dropped.
pub fn deliver(channel_id: ChannelId, tx: &mpsc::Sender<Outbound>, event: &Outbound) -> bool {
    match tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("Channel {} outbound queue full, dropping event", channel_id);
            false
        }
        Err(TrySendError::Closed(_)) => {
            trace!("Channel {} already closed", channel_id);
            false
        }
    }
}
