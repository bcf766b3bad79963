//! Decoded streaming chunk shapes.
//!
//! One `CompletionChunk` is the unit the stream decoder emits per SSE data
//! line. Chunks are transient: the chunk buffer folds them into accumulated
//! message state and they are never persisted directly.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlCitation {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub start_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub end_index: Option<u32>,
}

/// Citation annotation attached to a delta.
///
/// Forward compatible: unrecognized annotation types deserialize to
/// `Unknown` instead of failing the whole chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Citation {
    UrlCitation { url_citation: UrlCitation },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub annotations: Vec<Citation>,
}

impl ChunkDelta {
    /// True when the delta carries nothing worth buffering.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.as_deref().is_none_or(str::is_empty)
            && self.reasoning.as_deref().is_none_or(str::is_empty)
            && self.annotations.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CompletionChunk {
    /// Gateway-assigned generation id, present on the first chunk.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

impl CompletionChunk {
    #[must_use]
    pub fn first_choice(&self) -> Option<&ChunkChoice> {
        self.choices.first()
    }

    /// True when any choice carries an explicit finish reason.
    #[must_use]
    pub fn finish_reason(&self) -> Option<&str> {
        self.choices
            .iter()
            .find_map(|choice| choice.finish_reason.as_deref())
    }
}
