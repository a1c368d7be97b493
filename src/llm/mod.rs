//! Model driver trait and implementations.
//!
//! The [`LlmDriver`] trait defines the streaming interface the chat service
//! consumes: one request in, a finite sequence of plain-text fragments out.
//! Keeping the driver behind a trait object lets tests substitute a scripted
//! implementation for the hosted API.
//!
//! # Drivers
//!
//! - [`GeminiDriver`]: Google Gemini `streamGenerateContent` API

pub mod gemini;

pub use gemini::GeminiDriver;

use futures::Stream;

/// Connection and model settings for the hosted API.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// API key sent with every request.
    pub api_key: String,
    /// Model identifier (e.g. `gemini-2.5-flash`).
    pub model: String,
    /// Base URL of the API (e.g. `https://generativelanguage.googleapis.com`).
    pub base_url: String,
}

/// A full prompt for one streaming completion.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Fixed system instruction sent with every request.
    pub system_instruction: String,
    /// Prior turns plus the new user turn, oldest first.
    pub turns: Vec<Turn>,
}

/// One role-tagged turn of a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    /// Who produced the turn.
    pub role: TurnRole,
    /// Turn text.
    pub text: String,
}

/// Role labels recognized by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    /// The end user.
    User,
    /// The model's own prior output.
    Model,
}

impl TurnRole {
    /// The provider's wire label for this role.
    #[must_use]
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }
}

/// Trait for streaming model drivers.
///
/// Implementations open one completion in streaming mode and yield the text
/// fragments as they arrive. The sequence is finite and not restartable.
#[async_trait::async_trait]
pub trait LlmDriver: Send + Sync + std::fmt::Debug {
    /// Open a streaming completion for the given request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent or the provider
    /// rejects it before streaming begins. Failures after that surface as
    /// `Err` items in the stream.
    async fn stream(
        &self,
        req: LlmRequest,
    ) -> anyhow::Result<std::pin::Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>>;
}
