//! Outgoing completion request.

use serde::Serialize;

use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    #[default]
    Medium,
    High,
}

impl ReasoningEffort {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ReasoningConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Request reasoning internally without streaming it back.
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub exclude: bool,
}

impl ReasoningConfig {
    #[must_use]
    pub fn effort(effort: ReasoningEffort) -> Self {
        Self {
            effort: Some(effort),
            ..Self::default()
        }
    }
}

/// A chat-completion request. Immutable once issued: builders consume
/// and return `Self`, and nothing exposes interior mutation.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
}

impl CompletionRequest {
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
            max_tokens: None,
            temperature: None,
            reasoning: None,
        }
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub fn with_reasoning(mut self, reasoning: ReasoningConfig) -> Self {
        self.reasoning = Some(reasoning);
        self
    }

    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// The same request with its message list replaced (used by the cache
    /// strategy selector, which returns new messages rather than mutating).
    #[must_use]
    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_omitted_from_wire_body() {
        let request = CompletionRequest::new("openai/gpt-4o", vec![Message::user("hi")]);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], "openai/gpt-4o");
        assert_eq!(value["stream"], true);
        assert!(value.get("max_tokens").is_none());
        assert!(value.get("temperature").is_none());
        assert!(value.get("reasoning").is_none());
    }

    #[test]
    fn builder_sets_all_knobs() {
        let request = CompletionRequest::new("anthropic/claude-sonnet-4", vec![])
            .with_max_tokens(2048)
            .with_temperature(0.7)
            .with_reasoning(ReasoningConfig::effort(ReasoningEffort::High));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["max_tokens"], 2048);
        assert_eq!(value["reasoning"]["effort"], "high");
        assert!(value["reasoning"].get("exclude").is_none());
    }
}
