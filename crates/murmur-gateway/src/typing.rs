use std::collections::HashMap;
use std::time::{Duration, Instant};

use murmur_types::models::{ChatId, UserId};

/// Ephemeral "user is typing in room" indicators.
///
/// Entries expire after `timeout` without a refresh. Time is passed in by
/// the caller so expiry can be driven from a sweep task and tested directly.
pub struct TypingTracker {
    timeout: Duration,
    active: HashMap<(UserId, ChatId), Instant>,
}

impl TypingTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            active: HashMap::new(),
        }
    }

    /// Mark or refresh. Returns true if the user was not already typing there.
    pub fn start(&mut self, user_id: &str, chat_id: &str, now: Instant) -> bool {
        self.active
            .insert((user_id.to_string(), chat_id.to_string()), now)
            .is_none()
    }

    /// Returns true if an indicator was removed.
    pub fn stop(&mut self, user_id: &str, chat_id: &str) -> bool {
        self.active
            .remove(&(user_id.to_string(), chat_id.to_string()))
            .is_some()
    }

    /// Users with a live indicator in `chat_id`, sorted.
    pub fn who_is_typing(&self, chat_id: &str, now: Instant) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .active
            .iter()
            .filter(|((_, chat), started)| chat == chat_id && self.is_live(**started, now))
            .map(|((user, _), _)| user.clone())
            .collect();
        users.sort();
        users
    }

    /// Clear every indicator of a user. Returns the rooms that were affected.
    pub fn drop_user(&mut self, user_id: &str) -> Vec<ChatId> {
        let mut chats = Vec::new();
        self.active.retain(|(user, chat), _| {
            if user == user_id {
                chats.push(chat.clone());
                false
            } else {
                true
            }
        });
        chats.sort();
        chats
    }

    /// Remove expired indicators and return them.
    pub fn sweep(&mut self, now: Instant) -> Vec<(UserId, ChatId)> {
        let timeout = self.timeout;
        let mut expired = Vec::new();
        self.active.retain(|key, started| {
            if now.saturating_duration_since(*started) > timeout {
                expired.push(key.clone());
                false
            } else {
                true
            }
        });
        expired.sort();
        expired
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    fn is_live(&self, started: Instant, now: Instant) -> bool {
        now.saturating_duration_since(started) <= self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(6);

    #[test]
    fn start_refresh_and_stop() {
        let mut typing = TypingTracker::new(TIMEOUT);
        let t0 = Instant::now();
        assert!(typing.start("alice", "general", t0));
        assert!(!typing.start("alice", "general", t0 + Duration::from_secs(1)));
        assert_eq!(typing.who_is_typing("general", t0), vec!["alice".to_string()]);

        assert!(typing.stop("alice", "general"));
        assert!(!typing.stop("alice", "general"));
        assert!(typing.is_empty());
    }

    #[test]
    fn indicators_expire() {
        let mut typing = TypingTracker::new(TIMEOUT);
        let t0 = Instant::now();
        typing.start("alice", "general", t0);
        typing.start("bob", "general", t0 + Duration::from_secs(4));

        let later = t0 + Duration::from_secs(7);
        assert_eq!(typing.who_is_typing("general", later), vec!["bob".to_string()]);

        let expired = typing.sweep(later);
        assert_eq!(expired, vec![("alice".to_string(), "general".to_string())]);
        assert_eq!(typing.len(), 1);
    }

    #[test]
    fn refresh_extends_the_deadline() {
        let mut typing = TypingTracker::new(TIMEOUT);
        let t0 = Instant::now();
        typing.start("alice", "general", t0);
        typing.start("alice", "general", t0 + Duration::from_secs(5));
        assert!(typing.sweep(t0 + Duration::from_secs(9)).is_empty());
    }

    #[test]
    fn drop_user_clears_every_room() {
        let mut typing = TypingTracker::new(TIMEOUT);
        let t0 = Instant::now();
        typing.start("alice", "general", t0);
        typing.start("alice", "dm", t0);
        typing.start("bob", "general", t0);

        assert_eq!(typing.drop_user("alice"), vec!["dm".to_string(), "general".to_string()]);
        assert_eq!(typing.who_is_typing("general", t0), vec!["bob".to_string()]);
        assert!(typing.drop_user("alice").is_empty());
    }
}
