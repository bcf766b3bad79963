//! Prompt-cache request shaping.
//!
//! Providers with manual caching (Anthropic-family) require explicit
//! breakpoint markers on content blocks; automatic providers cache
//! transparently and the request passes through untouched. The transform
//! is deterministic and never mutates its input.

use murmur_types::{
    CacheControl, CacheKind, ContentBlock, Message, MessageContent, Role, capability_for_model,
    estimate_tokens,
};

/// Blocks shorter than this are not worth a cache write.
const MIN_BLOCK_TOKENS: u32 = 100;

/// Shape `messages` for the model's caching mechanism, returning a new
/// list. `None` and `Automatic` capabilities pass through unchanged, as
/// does any conversation below the capability's token threshold.
#[must_use]
pub fn apply_cache_strategy(model_id: &str, messages: &[Message]) -> Vec<Message> {
    let capability = capability_for_model(model_id);
    if capability.kind != CacheKind::Manual {
        return messages.to_vec();
    }

    let total_tokens: u32 = messages
        .iter()
        .map(|m| estimate_tokens(&m.text()))
        .sum();
    if total_tokens < capability.min_prompt_tokens {
        return messages.to_vec();
    }

    let last = messages.len().saturating_sub(1);
    messages
        .iter()
        .enumerate()
        .map(|(index, message)| {
            // System prompts are maximally reusable; history before the
            // in-flight turn is settled. The final message changes every
            // request and must never carry a marker.
            let eligible = message.role == Role::System || index != last;
            if eligible {
                mark_last_text_block(message)
            } else {
                message.clone()
            }
        })
        .collect()
}

/// Attach a cache marker to the message's last text block, converting
/// plain-text content to block form first. Short blocks are left alone.
fn mark_last_text_block(message: &Message) -> Message {
    let mut blocks = message.content.clone().into_blocks();
    if let Some(block) = blocks.iter_mut().rev().find(|b| b.is_text())
        && let ContentBlock::Text {
            text,
            cache_control,
        } = block
        && estimate_tokens(text) > MIN_BLOCK_TOKENS
    {
        *cache_control = Some(CacheControl::Ephemeral);
    }
    Message {
        role: message.role,
        content: MessageContent::Blocks(blocks),
    }
}
