use std::fmt;

use serde::{Deserialize, Serialize};

/// A class of AI functionality, e.g. `text.generation`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct CapabilityType(String);

impl CapabilityType {
    pub const TEXT_GENERATION: &'static str = "text.generation";

    /// Parse a capability name from a path segment or admin payload.
    /// Names are lowercase, dot-separated identifiers.
    pub fn parse(raw: &str) -> Option<Self> {
        let name = raw.trim().to_lowercase();
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.ends_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
        valid.then_some(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// Body of `POST /capability/{type}` and `/capability/{type}/stream`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityPayload {
    #[serde(default)]
    pub messages: Vec<Message>,
    pub prompt: Option<String>,
    /// Explicit model choice; never silently ignored.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    #[serde(alias = "max_tokens")]
    pub max_tokens: Option<u32>,
    #[serde(alias = "request_id")]
    pub request_id: Option<String>,
}

/// Normalized request handed to provider adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityRequest {
    pub request_id: String,
    pub messages: Vec<Message>,
    pub model_hint: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CapabilityPayload {
    /// Fold `prompt` into the message list. Returns `None` when there is nothing to send.
    pub fn into_request(self, request_id: String) -> Option<CapabilityRequest> {
        let mut messages = self.messages;
        if let Some(prompt) = self.prompt.filter(|p| !p.trim().is_empty()) {
            messages.push(Message {
                role: "user".into(),
                content: prompt,
            });
        }
        if messages.is_empty() {
            return None;
        }
        Some(CapabilityRequest {
            request_id,
            messages,
            model_hint: self.model.filter(|m| !m.trim().is_empty()),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cost {
    pub amount: f64,
    pub currency: String,
}

/// Buffered response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityResponse {
    pub text: String,
    pub model: String,
    pub provider: String,
    pub usage: TokenUsage,
    pub cost: Cost,
    pub request_id: String,
}

/// Final frame of a streamed response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageFrame {
    pub model: String,
    pub provider: String,
    pub usage: TokenUsage,
    pub cost: Cost,
    pub request_id: String,
}

/// What a gateway stream yields to the HTTP layer.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(String),
    Usage(UsageFrame),
    Error { kind: &'static str, message: String },
}
