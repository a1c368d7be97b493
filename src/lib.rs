//! Wayfinder
//!
//! A travel-planning chat backend that proxies messages to a hosted Gemini
//! model, streams replies back as plain text, and keeps per-conversation
//! history in memory.
//!
//! # Architecture
//!
//! - **Server**: Axum-based HTTP server with incremental `text/plain` streaming
//! - **Bridge**: Per-conversation exchange pipeline with commit-on-every-exit semantics
//! - **Driver**: SSE client for the Gemini `streamGenerateContent` API
//! - **Store**: In-memory conversation history with optional retention limits
//!
//! # Modules
//!
//! - [`bridge`]: Chat service wiring the driver to response streams
//! - [`conversation`]: History store, message types, and retention
//! - [`llm`]: Model driver trait and the Gemini implementation
//! - [`prompt`]: System instruction, validation, and request assembly

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::map_err_ignore)]
#![allow(clippy::unused_async)]

pub mod bridge;
pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod prompt;
pub mod server;

use crate::bridge::ChatService;
use crate::conversation::ConversationStore;
use crate::llm::LlmSettings;

use std::sync::Arc;

/// Application state shared across all handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Chat service for running exchanges.
    pub chat: Arc<ChatService>,
    /// Conversation store, read directly by the history and clear handlers.
    pub store: Arc<dyn ConversationStore>,
    /// Active model settings, reported by the health endpoint.
    pub settings: LlmSettings,
}
