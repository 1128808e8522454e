use std::collections::HashMap;

use tokio::sync::RwLock;

use murmur_types::models::{ChannelId, UserId};

/// Which channel each logged-in user is reachable on.
///
/// A user has at most one binding; logging in from a second channel moves it
/// there (last login wins). Unbinding is keyed by channel, so a stale channel
/// going away never clears a newer binding.
#[derive(Default)]
pub struct ConnectionRegistry {
    bindings: RwLock<Bindings>,
}

#[derive(Default)]
struct Bindings {
    by_user: HashMap<UserId, ChannelId>,
    by_channel: HashMap<ChannelId, UserId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user_id` to `channel_id`. Returns the channel the user was bound
    /// to before, if it was a different one.
    pub async fn bind(&self, user_id: &str, channel_id: ChannelId) -> Option<ChannelId> {
        let mut b = self.bindings.write().await;

        // A channel carries one user at a time
        if let Some(prev_user) = b.by_channel.remove(&channel_id) {
            if b.by_user.get(&prev_user) == Some(&channel_id) {
                b.by_user.remove(&prev_user);
            }
        }

        let previous = b.by_user.insert(user_id.to_string(), channel_id);
        if let Some(prev_channel) = previous {
            if prev_channel != channel_id {
                b.by_channel.remove(&prev_channel);
            }
        }
        b.by_channel.insert(channel_id, user_id.to_string());

        previous.filter(|prev| *prev != channel_id)
    }

    /// Remove the binding held by `channel_id`. Returns the user only if this
    /// channel was still that user's current binding.
    pub async fn unbind(&self, channel_id: ChannelId) -> Option<UserId> {
        let mut b = self.bindings.write().await;
        let user_id = b.by_channel.remove(&channel_id)?;
        if b.by_user.get(&user_id) == Some(&channel_id) {
            b.by_user.remove(&user_id);
            Some(user_id)
        } else {
            None
        }
    }

    pub async fn resolve(&self, user_id: &str) -> Option<ChannelId> {
        self.bindings.read().await.by_user.get(user_id).copied()
    }

    /// Every current binding, ordered by user id.
    pub async fn snapshot(&self) -> Vec<(UserId, ChannelId)> {
        let b = self.bindings.read().await;
        let mut all: Vec<_> = b
            .by_user
            .iter()
            .map(|(user, channel)| (user.clone(), *channel))
            .collect();
        all.sort();
        all
    }

    pub async fn len(&self) -> usize {
        self.bindings.read().await.by_user.len()
    }
}
