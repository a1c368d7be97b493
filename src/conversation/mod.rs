//! Conversation history types and storage.
//!
//! This module provides in-memory storage for conversation message history.
//! Conversations are identified by a caller-chosen string key and hold an
//! ordered list of user/assistant messages for the lifetime of the process.
//!
//! # Architecture
//!
//! - [`ConversationStore`]: storage contract used by the chat service and
//!   the read/clear endpoints
//! - [`MemoryStore`]: the in-memory implementation, with an optional
//!   [`RetentionPolicy`] for trimming and expiry
//!
//! # Example
//!
//! ```rust
//! use wayfinder::conversation::{ConversationStore, MemoryStore, Message, RetentionPolicy};
//!
//! let store = MemoryStore::new(RetentionPolicy::default());
//! store.append_exchange("trip1", Message::user("Hello"), Message::assistant("Hi there!"));
//!
//! let messages = store.get("trip1");
//! assert_eq!(messages.len(), 2);
//! ```

mod store;

pub use store::{ConversationStore, MemoryStore, Message, MessageRole, RetentionPolicy};
