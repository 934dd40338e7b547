use serde::{Deserialize, Serialize};

/// Provider families served by the OpenAI-compatible adapter.
/// All speak the chat completions format, but differ in base URL and headers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAI,
    OpenRouter,
    DashScope,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::OpenAI,
        ProviderKind::OpenRouter,
        ProviderKind::DashScope,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::DashScope => "dashscope",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Some(ProviderKind::OpenAI),
            "openrouter" => Some(ProviderKind::OpenRouter),
            "dashscope" => Some(ProviderKind::DashScope),
            _ => None,
        }
    }

    /// Default base URL for each provider kind, used when a model config leaves `endpoint` empty.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "https://api.openai.com/v1",
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1",
            ProviderKind::DashScope => "https://dashscope.aliyuncs.com/compatible-mode/v1",
        }
    }
}
