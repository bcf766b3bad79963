//! Per-message accumulation and flush scheduling.
//!
//! Persisting every network chunk would produce far more writes than
//! renders needed, so persistence is throttled by a dual trigger: flush
//! once either a configured number of fragments has accumulated since the
//! last flush, or a configured interval has elapsed. A terminal event
//! forces exactly one unconditional flush that marks the message complete
//! and destroys the buffer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use murmur_types::{ChunkDelta, Citation, MessageId};

use crate::persist::MessagePatch;

/// Dual-trigger flush thresholds. Tuned empirically; policy, not contract.
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    /// Flush once this many fragments arrive after the previous flush.
    pub size_threshold: usize,
    /// Flush once this long has passed since the previous flush.
    pub flush_interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            size_threshold: 2,
            flush_interval: Duration::from_millis(75),
        }
    }
}

/// Accumulated state for one in-flight message.
#[derive(Debug)]
struct MessageBuffer {
    content: String,
    reasoning: String,
    /// Raw fragments in arrival order; their count drives the size trigger.
    content_fragments: Vec<String>,
    reasoning_fragments: Vec<String>,
    annotations: Vec<Citation>,
    last_flush: Instant,
    pending_fragments: usize,
}

impl MessageBuffer {
    fn new(now: Instant) -> Self {
        Self {
            content: String::new(),
            reasoning: String::new(),
            content_fragments: Vec::new(),
            reasoning_fragments: Vec::new(),
            annotations: Vec::new(),
            last_flush: now,
            pending_fragments: 0,
        }
    }
}

/// Arena of message buffers, keyed by message id.
///
/// At most one buffer exists per id: created on first delta (or seeded for
/// resume), removed synchronously on terminal flush or discard, so nothing
/// can fire against a freed buffer.
#[derive(Debug)]
pub struct ChunkBuffer {
    buffers: HashMap<MessageId, MessageBuffer>,
    policy: FlushPolicy,
}

impl ChunkBuffer {
    #[must_use]
    pub fn new(policy: FlushPolicy) -> Self {
        Self {
            buffers: HashMap::new(),
            policy,
        }
    }

    /// Pre-create a buffer holding already-persisted content, so a resumed
    /// stream appends to it instead of starting from empty.
    pub fn seed(&mut self, id: MessageId, content: impl Into<String>, now: Instant) {
        let buffer = self
            .buffers
            .entry(id)
            .or_insert_with(|| MessageBuffer::new(now));
        buffer.content = content.into();
    }

    /// Append a delta, returning the full accumulated content for the UI.
    /// Empty deltas leave the buffer untouched and return `None`.
    pub fn accept(&mut self, id: MessageId, delta: &ChunkDelta, now: Instant) -> Option<String> {
        if delta.is_empty() {
            return None;
        }
        let buffer = self
            .buffers
            .entry(id)
            .or_insert_with(|| MessageBuffer::new(now));

        if let Some(content) = delta.content.as_deref().filter(|c| !c.is_empty()) {
            buffer.content.push_str(content);
            buffer.content_fragments.push(content.to_string());
            buffer.pending_fragments += 1;
        }
        if let Some(reasoning) = delta.reasoning.as_deref().filter(|r| !r.is_empty()) {
            buffer.reasoning.push_str(reasoning);
            buffer.reasoning_fragments.push(reasoning.to_string());
            buffer.pending_fragments += 1;
        }
        buffer.annotations.extend(delta.annotations.iter().cloned());

        Some(buffer.content.clone())
    }

    /// Whether the size or time trigger has fired for this id.
    #[must_use]
    pub fn should_flush(&self, id: MessageId, now: Instant) -> bool {
        self.buffers.get(&id).is_some_and(|buffer| {
            buffer.pending_fragments > 0
                && (buffer.pending_fragments >= self.policy.size_threshold
                    || now.duration_since(buffer.last_flush) >= self.policy.flush_interval)
        })
    }

    /// When the time trigger will next fire, given fragments are pending.
    #[must_use]
    pub fn next_deadline(&self, id: MessageId) -> Option<Instant> {
        let buffer = self.buffers.get(&id)?;
        if buffer.pending_fragments == 0 {
            return None;
        }
        Some(buffer.last_flush + self.policy.flush_interval)
    }

    /// Build the patch for a throttled (incomplete) flush and reset the
    /// pending counter. `None` when nothing has accumulated since the last
    /// flush.
    pub fn take_patch(&mut self, id: MessageId, now: Instant) -> Option<MessagePatch> {
        let buffer = self.buffers.get_mut(&id)?;
        if buffer.pending_fragments == 0 {
            return None;
        }
        buffer.pending_fragments = 0;
        buffer.last_flush = now;
        Some(Self::patch_of(buffer, false))
    }

    /// Terminal flush: build the completing patch and destroy the buffer.
    /// Returns a bare completion marker when no buffer exists (a stream
    /// that finished without ever producing a delta).
    pub fn finalize(&mut self, id: MessageId) -> MessagePatch {
        match self.buffers.remove(&id) {
            Some(buffer) => Self::patch_of(&buffer, true),
            None => MessagePatch {
                is_complete: Some(true),
                ..MessagePatch::default()
            },
        }
    }

    /// Drop the buffer without a terminal flush (cancellation path).
    pub fn discard(&mut self, id: MessageId) {
        self.buffers.remove(&id);
    }

    /// Full accumulated content for an id, if a buffer exists.
    #[must_use]
    pub fn content(&self, id: MessageId) -> Option<&str> {
        self.buffers.get(&id).map(|b| b.content.as_str())
    }

    fn patch_of(buffer: &MessageBuffer, complete: bool) -> MessagePatch {
        MessagePatch {
            content: Some(buffer.content.clone()),
            reasoning: (!buffer.reasoning.is_empty()).then(|| buffer.reasoning.clone()),
            annotations: (!buffer.annotations.is_empty()).then(|| buffer.annotations.clone()),
            is_complete: complete.then_some(true),
            generation_id: None,
        }
    }
}
