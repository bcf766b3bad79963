//! Persistence seam.
//!
//! The session crate never talks to storage directly; it emits
//! [`MessagePatch`]es through a caller-supplied [`PersistenceSink`]. The
//! same sink is queried at startup for messages whose stream was
//! interrupted, which drives the resume protocol.

use murmur_types::{ChatId, Citation, GenerationId, MessageId};

/// Partial update to a persisted message. `None` fields are left alone by
/// the sink; `Some` fields overwrite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub annotations: Option<Vec<Citation>>,
    pub is_complete: Option<bool>,
    pub generation_id: Option<GenerationId>,
}

impl MessagePatch {
    /// Patch recording only the gateway-assigned generation id. Written
    /// the moment the id is known, so an interrupted stream stays
    /// resumable.
    #[must_use]
    pub fn generation(id: GenerationId) -> Self {
        Self {
            generation_id: Some(id),
            ..Self::default()
        }
    }
}

/// A persisted message whose stream never saw a terminal event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumableMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub generation_id: GenerationId,
    /// Content flushed before the interruption; resume appends to it.
    pub content: String,
}

/// Storage backend for in-flight and interrupted messages.
pub trait PersistenceSink: Send + Sync {
    /// Apply a patch to the message. Called on every flush.
    fn update_message(
        &self,
        id: MessageId,
        patch: MessagePatch,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Messages marked incomplete that already carry a generation id.
    fn load_incomplete(&self) -> impl Future<Output = anyhow::Result<Vec<ResumableMessage>>> + Send;
}
