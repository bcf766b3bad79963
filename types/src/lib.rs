//! Core domain types for Murmur's streaming completion runtime.
//!
//! This crate is pure data: no IO, no async. It defines
//!
//! - the request-side message model ([`Message`], [`ContentBlock`]) and
//!   the [`CompletionRequest`] wire shape,
//! - the decoded stream chunk shapes ([`CompletionChunk`], [`ChunkDelta`]),
//! - id newtypes ([`MessageId`], [`ChatId`], [`GenerationId`]),
//! - prompt-cache capability resolution ([`capability_for_model`]).

pub mod cache;
pub mod chunk;
pub mod ids;
pub mod message;
pub mod request;

pub use cache::{CacheCapability, CacheKind, capability_for_model, estimate_tokens};
pub use chunk::{ChunkChoice, ChunkDelta, Citation, CompletionChunk, UrlCitation};
pub use ids::{ChatId, GenerationId, MessageId};
pub use message::{CacheControl, ContentBlock, FileData, ImageUrl, Message, MessageContent, Role};
pub use request::{CompletionRequest, ReasoningConfig, ReasoningEffort};

/// Gateway API key.
///
/// `Debug` is manually implemented to redact the key value, preventing
/// accidental credential disclosure in logs or error messages.
#[derive(Clone)]
pub struct ApiKey(String);

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ApiKey(<redacted>)")
    }
}

impl ApiKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}
