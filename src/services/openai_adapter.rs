use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header;
use serde_json::{json, Value};

use crate::models::capability::{CapabilityRequest, TokenUsage};
use crate::models::model_config::ModelConfig;
use crate::models::provider::ProviderKind;
use crate::services::provider_adapter::{
    AdapterRegistry, ChunkStream, ProviderAdapter, ProviderError, ProviderResponse, StreamChunk,
};

const GATEWAY_TITLE: &str = "capability-gateway";

/// Adapter for every provider that speaks the chat completions wire format.
/// The provider kind only changes extra headers; the endpoint and credential
/// come from the model config.
pub struct OpenAiCompatibleAdapter {
    http: reqwest::Client,
    kind: ProviderKind,
}

impl OpenAiCompatibleAdapter {
    pub fn new(http: reqwest::Client, kind: ProviderKind) -> Self {
        Self { http, kind }
    }

    fn request_body(target: &ModelConfig, request: &CapabilityRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": target.model,
            "messages": request.messages,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(n) = request.max_tokens {
            body["max_tokens"] = json!(n);
        }
        if stream {
            body["stream"] = json!(true);
            // Most compatible providers only report usage on streams when asked.
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }

    async fn send(
        &self,
        target: &ModelConfig,
        request: &CapabilityRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", target.endpoint.trim_end_matches('/'));

        let mut upstream = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, format!("Bearer {}", target.credential))
            .header("x-request-id", request.request_id.as_str())
            .json(&Self::request_body(target, request, stream));

        if self.kind == ProviderKind::OpenRouter {
            upstream = upstream.header("X-Title", GATEWAY_TITLE);
        }

        let resp = upstream.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        Err(ProviderError::Upstream {
            status: status.as_u16(),
            message: upstream_error_message(&body),
        })
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    async fn invoke(
        &self,
        target: &ModelConfig,
        request: &CapabilityRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let resp = self.send(target, request, false).await?;
        let json: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        parse_completion(&json)
    }

    async fn stream(
        &self,
        target: &ModelConfig,
        request: &CapabilityRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let resp = self.send(target, request, true).await?;
        let mut bytes = Box::pin(resp.bytes_stream());

        let stream: ChunkStream = Box::pin(async_stream::try_stream! {
            let mut parser = SseParser::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk?;
                for data in parser.push(&chunk) {
                    if let Some(parsed) = parse_stream_event(&data)? {
                        yield parsed;
                    }
                }
            }
        });
        Ok(stream)
    }
}

/// Register one compatible adapter per known provider kind. Any other
/// provider name is assumed to be a compatible endpoint without extra headers.
pub fn register_all(registry: &mut AdapterRegistry, http: &reqwest::Client) {
    for kind in ProviderKind::ALL {
        registry.register(
            kind.as_str(),
            Arc::new(OpenAiCompatibleAdapter::new(http.clone(), kind)),
        );
    }
    registry.set_fallback(Arc::new(OpenAiCompatibleAdapter::new(
        http.clone(),
        ProviderKind::OpenAI,
    )));
}

fn upstream_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|j| {
            j.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn parse_usage(json: &Value) -> Option<TokenUsage> {
    let usage = json.get("usage").filter(|u| !u.is_null())?;
    let field = |name: &str| {
        usage
            .get(name)
            .and_then(Value::as_u64)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or(0)
    };
    Some(TokenUsage {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
    })
}

fn parse_completion(json: &Value) -> Result<ProviderResponse, ProviderError> {
    let text = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::InvalidResponse("missing choices[0].message.content".into()))?
        .to_string();

    Ok(ProviderResponse {
        text,
        usage: parse_usage(json).unwrap_or_default(),
    })
}

/// Decode one `data:` payload. Keep-alive and usage-less empty deltas yield `None`.
fn parse_stream_event(data: &str) -> Result<Option<StreamChunk>, ProviderError> {
    let json: Value =
        serde_json::from_str(data).map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

    if let Some(err) = json.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("stream error")
            .to_string();
        return Err(ProviderError::Upstream { status: 200, message });
    }

    let text = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let usage = parse_usage(&json);

    if text.is_empty() && usage.is_none() {
        return Ok(None);
    }
    Ok(Some(StreamChunk { text, usage }))
}

/// Incremental SSE line splitter. Network chunks may cut events anywhere,
/// so partial lines are held until their newline arrives.
#[derive(Default)]
struct SseParser {
    pending: Vec<u8>,
}

impl SseParser {
    /// Feed raw bytes, return the complete `data:` payloads they finish.
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut out = Vec::new();

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() && data != "[DONE]" {
                    out.push(data.to_string());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_parser_handles_split_events() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"data: {\"a\"").is_empty());
        assert_eq!(parser.push(b":1}\n\n: keep-alive\n"), vec!["{\"a\":1}"]);
        assert!(parser.push(b"data: [DONE]\n\n").is_empty());
    }

    #[test]
    fn stream_event_extracts_delta_and_usage() {
        let chunk = parse_stream_event(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.text, "Hel");
        assert_eq!(chunk.usage, None);

        let last = parse_stream_event(
            r#"{"choices":[],"usage":{"prompt_tokens":9,"completion_tokens":4,"total_tokens":13}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(last.text, "");
        assert_eq!(
            last.usage,
            Some(TokenUsage {
                prompt_tokens: 9,
                completion_tokens: 4
            })
        );
    }

    #[test]
    fn role_only_delta_is_skipped() {
        assert!(parse_stream_event(r#"{"choices":[{"delta":{"role":"assistant"}}],"usage":null}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn in_band_stream_error_fails_the_attempt() {
        let err = parse_stream_event(r#"{"error":{"message":"overloaded"}}"#).unwrap_err();
        assert!(matches!(err, ProviderError::Upstream { message, .. } if message == "overloaded"));
    }

    #[test]
    fn completion_body_is_parsed() {
        let json: Value = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}],
                "usage":{"prompt_tokens":3,"completion_tokens":1}}"#,
        )
        .unwrap();
        let resp = parse_completion(&json).unwrap();
        assert_eq!(resp.text, "hi");
        assert_eq!(resp.usage.total(), 4);

        assert!(parse_completion(&json!({"choices": []})).is_err());
    }

    #[test]
    fn error_message_prefers_json_error_field() {
        assert_eq!(
            upstream_error_message(r#"{"error":{"message":"bad key"}}"#),
            "bad key"
        );
        assert_eq!(upstream_error_message("gateway timeout"), "gateway timeout");
    }

    #[test]
    fn stream_body_requests_usage() {
        let cap = crate::services::memory_store::fixtures::text_generation();
        let target = crate::services::memory_store::fixtures::model(&cap, "openai", "gpt-a", 1);
        let request = CapabilityRequest {
            request_id: "r".into(),
            messages: vec![],
            model_hint: None,
            temperature: Some(0.5),
            max_tokens: None,
        };
        let body = OpenAiCompatibleAdapter::request_body(&target, &request, true);
        assert_eq!(body["model"], "gpt-a");
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert!(body.get("max_tokens").is_none());
    }
}
