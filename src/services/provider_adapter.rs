use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::models::capability::{CapabilityRequest, TokenUsage};
use crate::models::model_config::ModelConfig;

/// Characters per synthesized chunk when a provider has no native stream.
const SYNTHETIC_CHUNK_CHARS: usize = 48;

/// Failure of one attempt against one backend. Always triggers failover;
/// never surfaced to the client directly.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("malformed upstream response: {0}")]
    InvalidResponse(String),

    #[error("no adapter registered for provider \"{0}\"")]
    Unsupported(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Transport(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// One increment of a streamed generation. Providers may report usage on any
/// chunk; the last report wins.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// Lazily produced, cancellable: dropping it releases the upstream connection.
pub type ChunkStream = BoxStream<'static, Result<StreamChunk, ProviderError>>;

/// Uniform invocation interface for one provider family.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn invoke(
        &self,
        target: &ModelConfig,
        request: &CapabilityRequest,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Adapters with a native streaming API must override this. The default
    /// buffers the full response and replays it in chunks.
    async fn stream(
        &self,
        target: &ModelConfig,
        request: &CapabilityRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let response = self.invoke(target, request).await?;
        Ok(synthesize_stream(response))
    }
}

/// Split a buffered response into a chunk stream. Usage rides on the last chunk.
pub fn synthesize_stream(response: ProviderResponse) -> ChunkStream {
    let chars: Vec<char> = response.text.chars().collect();
    let mut chunks: Vec<Result<StreamChunk, ProviderError>> = chars
        .chunks(SYNTHETIC_CHUNK_CHARS)
        .map(|c| {
            Ok(StreamChunk {
                text: c.iter().collect(),
                usage: None,
            })
        })
        .collect();

    match chunks.last_mut() {
        Some(Ok(last)) => last.usage = Some(response.usage),
        _ => chunks.push(Ok(StreamChunk {
            text: String::new(),
            usage: Some(response.usage),
        })),
    }

    tokio_stream::iter(chunks).boxed()
}

/// Maps `ModelConfig.provider` to the adapter that serves it.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    /// Serves providers with no adapter of their own, if set.
    fallback: Option<Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: &str, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(provider.to_lowercase(), adapter);
    }

    pub fn set_fallback(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.fallback = Some(adapter);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&provider.to_lowercase())
            .or(self.fallback.as_ref())
            .cloned()
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn synthesized_stream_reassembles_text_and_carries_usage_last() {
        let text = "é".repeat(SYNTHETIC_CHUNK_CHARS * 2 + 5);
        let usage = TokenUsage {
            prompt_tokens: 3,
            completion_tokens: 7,
        };
        let chunks: Vec<StreamChunk> = synthesize_stream(ProviderResponse {
            text: text.clone(),
            usage,
        })
        .map(|c| c.unwrap())
        .collect()
        .await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(|c| c.text.as_str()).collect::<String>(), text);
        assert!(chunks[..2].iter().all(|c| c.usage.is_none()));
        assert_eq!(chunks[2].usage, Some(usage));
    }

    #[tokio::test]
    async fn empty_response_still_reports_usage() {
        let chunks: Vec<_> = synthesize_stream(ProviderResponse {
            text: String::new(),
            usage: TokenUsage::default(),
        })
        .collect()
        .await;
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn registry_lookup_is_case_insensitive() {
        let mut registry = AdapterRegistry::new();
        registry.register("OpenAI", testing::ScriptedAdapter::reply("hi", 1, 1));
        assert!(registry.get("openai").is_some());
        assert!(registry.get("other").is_none());
        assert_eq!(registry.providers(), vec!["openai"]);
    }

    #[test]
    fn fallback_serves_unknown_providers() {
        let mut registry = AdapterRegistry::new();
        registry.set_fallback(testing::ScriptedAdapter::reply("hi", 1, 1));
        assert!(registry.get("self-hosted").is_some());
    }
}
