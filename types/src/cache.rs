//! Prompt-cache capability resolution.
//!
//! Whether and how a model supports prompt caching is a pure function of
//! its id: the id is matched against an ordered list of provider prefixes.
//! Capabilities are stateless and recomputed per request.

/// How a model's provider exposes prompt caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// No caching support; requests pass through untouched.
    None,
    /// Provider caches transparently; no request transformation needed.
    Automatic,
    /// Provider requires explicit cache breakpoints on content blocks.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheCapability {
    pub kind: CacheKind,
    /// Minimum estimated prompt tokens before caching is worth attempting.
    pub min_prompt_tokens: u32,
    /// Cost of a cache write relative to an uncached input token.
    pub write_cost_multiplier: f32,
    /// Cost of a cache read relative to an uncached input token.
    pub read_cost_multiplier: f32,
}

impl CacheCapability {
    pub const NONE: Self = Self {
        kind: CacheKind::None,
        min_prompt_tokens: 0,
        write_cost_multiplier: 1.0,
        read_cost_multiplier: 1.0,
    };
}

/// Ordered provider patterns; first prefix match wins.
const CAPABILITY_PATTERNS: &[(&str, CacheCapability)] = &[
    (
        "anthropic/",
        CacheCapability {
            kind: CacheKind::Manual,
            min_prompt_tokens: 1024,
            write_cost_multiplier: 1.25,
            read_cost_multiplier: 0.1,
        },
    ),
    (
        "openai/",
        CacheCapability {
            kind: CacheKind::Automatic,
            min_prompt_tokens: 1024,
            write_cost_multiplier: 1.0,
            read_cost_multiplier: 0.5,
        },
    ),
    (
        "google/",
        CacheCapability {
            kind: CacheKind::Automatic,
            min_prompt_tokens: 2048,
            write_cost_multiplier: 1.0,
            read_cost_multiplier: 0.25,
        },
    ),
    (
        "deepseek/",
        CacheCapability {
            kind: CacheKind::Automatic,
            min_prompt_tokens: 1024,
            write_cost_multiplier: 1.0,
            read_cost_multiplier: 0.1,
        },
    ),
];

/// Resolve the cache capability for a model id.
#[must_use]
pub fn capability_for_model(model_id: &str) -> CacheCapability {
    let lower = model_id.trim().to_ascii_lowercase();
    CAPABILITY_PATTERNS
        .iter()
        .find(|(prefix, _)| lower.starts_with(prefix))
        .map_or(CacheCapability::NONE, |(_, capability)| *capability)
}

/// Rough token estimate: one token per four characters.
#[must_use]
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() / 4) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_models_resolve_manual() {
        let capability = capability_for_model("anthropic/claude-sonnet-4");
        assert_eq!(capability.kind, CacheKind::Manual);
        assert_eq!(capability.min_prompt_tokens, 1024);
    }

    #[test]
    fn openai_models_resolve_automatic() {
        let capability = capability_for_model("openai/gpt-4o-mini");
        assert_eq!(capability.kind, CacheKind::Automatic);
    }

    #[test]
    fn unknown_provider_resolves_none() {
        let capability = capability_for_model("mistralai/mistral-large");
        assert_eq!(capability.kind, CacheKind::None);
    }

    #[test]
    fn resolution_is_case_insensitive() {
        let capability = capability_for_model("Anthropic/Claude-Opus-4");
        assert_eq!(capability.kind, CacheKind::Manual);
    }

    #[test]
    fn estimate_is_chars_over_four() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(4096)), 1024);
    }

    #[test]
    fn estimate_counts_chars_not_bytes() {
        // 4 multi-byte chars = 1 estimated token
        assert_eq!(estimate_tokens("日本語だ"), 1);
    }
}
