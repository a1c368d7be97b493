//! Conversation storage and retention.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message author.
    pub role: MessageRole,
    /// Message text.
    pub content: String,
}

impl Message {
    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User message.
    User,
    /// Assistant response.
    Assistant,
}

/// Retention limits applied by [`MemoryStore`].
///
/// Both knobs default to `None`, which keeps every conversation and every
/// message until the process exits or the conversation is cleared.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionPolicy {
    /// Maximum user/assistant pairs kept per conversation. The oldest pairs
    /// are dropped when an append exceeds the limit.
    pub max_turns: Option<usize>,
    /// Inactivity window after which a conversation may be swept.
    pub idle_timeout: Option<Duration>,
}

/// Storage contract for conversation history.
///
/// The chat service commits exchanges through this trait, and the HTTP
/// surface reads and clears through it, so a persistent backing store can
/// replace [`MemoryStore`] without touching either. Methods take interior
/// locks and never await, which lets the commit step run inside a `Drop`
/// implementation.
pub trait ConversationStore: Send + Sync + std::fmt::Debug {
    /// Snapshot a conversation, registering the key if it is new.
    fn get_or_create(&self, id: &str) -> Vec<Message>;

    /// Snapshot a conversation without creating it.
    ///
    /// Unknown ids yield an empty list. A reader may race with an in-flight
    /// exchange; the exchange becomes visible only once its pair commits.
    fn get(&self, id: &str) -> Vec<Message>;

    /// Append one user/assistant pair as a single atomic write, creating
    /// the conversation if needed.
    fn append_exchange(&self, id: &str, user: Message, assistant: Message);

    /// Remove a conversation entirely. A no-op for unknown ids.
    fn clear(&self, id: &str);

    /// Number of stored conversations.
    fn len(&self) -> usize;

    /// Whether no conversations are stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct ConversationEntry {
    messages: Vec<Message>,
    last_activity: DateTime<Utc>,
}

impl ConversationEntry {
    fn new() -> Self {
        Self {
            messages: Vec::new(),
            last_activity: Utc::now(),
        }
    }

    fn is_idle(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if let Ok(elapsed) = (now - self.last_activity).to_std() {
            elapsed > timeout
        } else {
            // Negative duration means clock skew or activity "in the future".
            false
        }
    }
}

/// Thread-safe in-memory conversation store.
///
/// Without a [`RetentionPolicy`] the key set and each message list grow
/// without bound for the lifetime of the process; deployments that expect
/// long-lived traffic should configure `max_turns` and `idle_timeout`.
#[derive(Debug)]
pub struct MemoryStore {
    conversations: RwLock<HashMap<String, ConversationEntry>>,
    policy: RetentionPolicy,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

impl MemoryStore {
    /// Create a store with the given retention policy.
    #[must_use]
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// The retention policy this store was built with.
    #[must_use]
    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Remove conversations idle for longer than the policy's timeout.
    ///
    /// Returns the number of conversations removed. Does nothing when no
    /// idle timeout is configured.
    pub fn sweep_idle(&self) -> usize {
        let Some(timeout) = self.policy.idle_timeout else {
            return 0;
        };

        let now = Utc::now();
        let mut guard = self.conversations.write().unwrap();
        let before = guard.len();
        guard.retain(|_, entry| !entry.is_idle(now, timeout));
        before - guard.len()
    }
}

impl ConversationStore for MemoryStore {
    fn get_or_create(&self, id: &str) -> Vec<Message> {
        let mut guard = self.conversations.write().unwrap();
        let entry = guard
            .entry(id.to_string())
            .or_insert_with(ConversationEntry::new);
        entry.last_activity = Utc::now();
        entry.messages.clone()
    }

    fn get(&self, id: &str) -> Vec<Message> {
        let guard = self.conversations.read().unwrap();
        guard
            .get(id)
            .map(|entry| entry.messages.clone())
            .unwrap_or_default()
    }

    fn append_exchange(&self, id: &str, user: Message, assistant: Message) {
        let mut guard = self.conversations.write().unwrap();
        let entry = guard
            .entry(id.to_string())
            .or_insert_with(ConversationEntry::new);

        entry.messages.push(user);
        entry.messages.push(assistant);

        if let Some(max_turns) = self.policy.max_turns {
            let max_messages = max_turns.saturating_mul(2);
            if entry.messages.len() > max_messages {
                let excess = entry.messages.len() - max_messages;
                entry.messages.drain(..excess);
            }
        }

        entry.last_activity = Utc::now();
    }

    fn clear(&self, id: &str) {
        let mut guard = self.conversations.write().unwrap();
        guard.remove(id);
    }

    fn len(&self) -> usize {
        self.conversations.read().unwrap().len()
    }
}
