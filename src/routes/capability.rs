use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    routing::post,
    Extension, Json, Router,
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::auth::ClientIdentity;
use crate::models::capability::{
    CapabilityPayload, CapabilityRequest, CapabilityResponse, CapabilityType, StreamEvent,
};
use crate::models::client::CapabilityPermission;
use crate::state::AppState;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Everything that must pass before a provider is contacted: permission,
/// payload, model allow-list, quota, then rate. Requests the permission
/// forbids never consume quota or rate budget.
async fn admit(
    state: &AppState,
    identity: ClientIdentity,
    raw_capability: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<(CapabilityPermission, CapabilityRequest), AppError> {
    let capability = CapabilityType::parse(raw_capability).ok_or_else(|| {
        AppError::BadRequest(format!("Invalid capability type: {raw_capability}"))
    })?;
    let permission = state.router.permission_for(identity.client_id, &capability)?;

    let payload: CapabilityPayload = if body.is_empty() {
        CapabilityPayload::default()
    } else {
        serde_json::from_slice(body).map_err(|e| AppError::BadRequest(format!("Invalid JSON: {e}")))?
    };

    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| payload.request_id.clone())
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let request = payload
        .into_request(request_id)
        .ok_or_else(|| AppError::BadRequest("\"messages\" or \"prompt\" is required".into()))?;

    state
        .router
        .candidates(&permission, request.model_hint.as_deref())?;
    state.quota.admit(identity.client_id, &permission).await?;
    Ok((permission, request))
}

/// POST /capability/{type}: buffered invocation.
async fn invoke(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Path(capability): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CapabilityResponse>, AppError> {
    let (permission, request) = admit(&state, identity, &capability, &headers, &body).await?;
    let response = state
        .router
        .dispatch(identity.client_id, &permission, &request)
        .await?;
    Ok(Json(response))
}

fn sse_event(event: StreamEvent) -> Result<Event, axum::Error> {
    match event {
        StreamEvent::Chunk(text) => Event::default().event("chunk").json_data(json!({ "text": text })),
        StreamEvent::Usage(frame) => Event::default().event("usage").json_data(frame),
        StreamEvent::Error { kind, message } => Event::default()
            .event("error")
            .json_data(json!({ "kind": kind, "message": message })),
    }
}

/// POST /capability/{type}/stream: SSE invocation. Errors before the first
/// chunk are plain JSON error responses; later ones arrive as an `error` event.
async fn invoke_stream(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    Path(capability): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let (permission, request) = admit(&state, identity, &capability, &headers, &body).await?;
    let routed = state
        .router
        .dispatch_stream(identity.client_id, &permission, &request)
        .await?;

    tracing::debug!(
        request_id = %request.request_id,
        provider = %routed.provider,
        model = %routed.model,
        "Streaming response"
    );
    Ok(Sse::new(routed.events.map(sse_event)).keep_alive(KeepAlive::default()))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/capability/{capability}", post(invoke))
        .route("/capability/{capability}/stream", post(invoke_stream))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use chrono::Utc;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::models::client::ClientStatus;
    use crate::models::usage_record::UsageStatus;
    use crate::services::credential_gate::CredentialMode;
    use crate::services::memory_store::{fixtures, MemoryStore};
    use crate::services::provider_adapter::testing::{Behavior, ScriptedAdapter};
    use crate::services::provider_adapter::AdapterRegistry;

    use super::*;

    struct TestApp {
        app: Router,
        store: Arc<MemoryStore>,
        client_id: Uuid,
    }

    async fn setup(
        tweak: impl FnOnce(&mut CapabilityPermission),
        adapter: Arc<ScriptedAdapter>,
    ) -> TestApp {
        let store = Arc::new(MemoryStore::default());
        let cap = fixtures::text_generation();
        let client = fixtures::client(
            "key-1",
            &CredentialMode::Hashed.stored_form("secret-1"),
            ClientStatus::Active,
        );
        let client_id = client.id;
        store.put_client(client);
        let mut permission = fixtures::permission(client_id, &cap);
        tweak(&mut permission);
        store.put_permission(permission);
        store.put_model(fixtures::model(&cap, "openai", "gpt-a", 10));

        let mut adapters = AdapterRegistry::new();
        adapters.register("openai", adapter);
        let state = AppState::for_tests(store.clone(), adapters).await;

        TestApp {
            app: crate::routes::app(state),
            store,
            client_id,
        }
    }

    fn call(path: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("x-api-key", "key-1")
            .header("x-api-secret", "secret-1")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: axum::response::Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn buffered_call_returns_text_usage_and_cost() {
        let t = setup(|_| {}, ScriptedAdapter::reply("hi there", 1000, 500)).await;
        let resp = t
            .app
            .oneshot(call(
                "/capability/text.generation",
                r#"{"prompt":"hello","requestId":"abc"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["text"], "hi there");
        assert_eq!(body["provider"], "openai");
        assert_eq!(body["model"], "gpt-a");
        assert_eq!(body["requestId"], "abc");
        assert_eq!(body["usage"]["promptTokens"], 1000);
        assert_eq!(body["cost"]["amount"], 2.0);
        assert_eq!(body["cost"]["currency"], "USD");
        assert_eq!(t.store.count_with_status(UsageStatus::Success), 1);
    }

    #[tokio::test]
    async fn wrong_secret_is_unauthenticated() {
        let t = setup(|_| {}, ScriptedAdapter::reply("hi", 1, 1)).await;
        let req = Request::builder()
            .method("POST")
            .uri("/capability/text.generation")
            .header("x-api-key", "key-1")
            .header("x-api-secret", "wrong")
            .body(Body::from(r#"{"prompt":"x"}"#))
            .unwrap();
        let resp = t.app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(resp).await["error"]["kind"], "unauthenticated");
    }

    #[tokio::test]
    async fn disabled_capability_is_forbidden_without_provider_call() {
        let adapter = ScriptedAdapter::reply("hi", 1, 1);
        let t = setup(|p| p.enabled = false, adapter.clone()).await;
        let resp = t
            .app
            .oneshot(call("/capability/text.generation", r#"{"prompt":"x"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(resp).await["error"]["kind"], "capability_disabled");
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn disallowed_model_is_forbidden() {
        let t = setup(
            |p| p.allowed_models = vec!["gpt-a".into()],
            ScriptedAdapter::reply("hi", 1, 1),
        )
        .await;
        let resp = t
            .app
            .oneshot(call(
                "/capability/text.generation",
                r#"{"prompt":"x","model":"gpt-z"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(resp).await["error"]["kind"], "model_not_allowed");
    }

    #[tokio::test]
    async fn rate_limit_returns_429_with_retry_after() {
        let adapter = ScriptedAdapter::reply("hi", 1, 1);
        let t = setup(|p| p.rate_limit_per_minute = 1, adapter.clone()).await;
        let first = t
            .app
            .clone()
            .oneshot(call("/capability/text.generation", r#"{"prompt":"x"}"#))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = t
            .app
            .oneshot(call("/capability/text.generation", r#"{"prompt":"x"}"#))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(header::RETRY_AFTER));
        assert_eq!(adapter.calls(), 1);
        assert_eq!(t.store.usage_records().len(), 1);
        assert_eq!(t.store.count_with_status(UsageStatus::Success), 1);
    }

    #[tokio::test]
    async fn disallowed_model_does_not_consume_rate_or_quota() {
        let adapter = ScriptedAdapter::reply("hi", 1, 1);
        let t = setup(
            |p| {
                p.rate_limit_per_minute = 1;
                p.allowed_models = vec!["gpt-a".into()];
            },
            adapter.clone(),
        )
        .await;

        let forbidden = t
            .app
            .clone()
            .oneshot(call(
                "/capability/text.generation",
                r#"{"prompt":"x","model":"gpt-z"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let allowed = t
            .app
            .oneshot(call("/capability/text.generation", r#"{"prompt":"x"}"#))
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn disallowed_model_is_reported_before_quota() {
        let t = setup(
            |p| {
                p.quota_limit = Some(1.0);
                p.allowed_models = vec!["gpt-a".into()];
            },
            ScriptedAdapter::reply("hi", 1, 1),
        )
        .await;
        t.store.push_usage_at(
            fixtures::spend(t.client_id, &fixtures::text_generation(), 1.0),
            Utc::now(),
        );
        let resp = t
            .app
            .oneshot(call(
                "/capability/text.generation",
                r#"{"prompt":"x","model":"gpt-z"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(resp).await["error"]["kind"], "model_not_allowed");
    }

    #[tokio::test]
    async fn exhausted_quota_returns_402() {
        let adapter = ScriptedAdapter::reply("hi", 1, 1);
        let t = setup(|p| p.quota_limit = Some(1.0), adapter.clone()).await;
        t.store.push_usage_at(
            fixtures::spend(t.client_id, &fixtures::text_generation(), 1.0),
            Utc::now(),
        );
        let resp = t
            .app
            .oneshot(call("/capability/text.generation", r#"{"prompt":"x"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(json_body(resp).await["error"]["kind"], "quota_exceeded");
        assert_eq!(adapter.calls(), 0);
        // Only the seeded spend row, nothing recorded for the rejected call.
        assert_eq!(t.store.usage_records().len(), 1);
    }

    #[tokio::test]
    async fn malformed_or_empty_body_is_bad_request() {
        let t = setup(|_| {}, ScriptedAdapter::reply("hi", 1, 1)).await;
        let resp = t
            .app
            .clone()
            .oneshot(call("/capability/text.generation", "{not json"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = t
            .app
            .oneshot(call("/capability/text.generation", r#"{"messages":[]}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn exhausted_backends_return_503() {
        let t = setup(|_| {}, ScriptedAdapter::new(Behavior::Fail)).await;
        let resp = t
            .app
            .oneshot(call("/capability/text.generation", r#"{"prompt":"x"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(resp).await["error"]["kind"], "no_available_backend");
        assert_eq!(t.store.count_with_status(UsageStatus::Failure), 1);
    }

    #[tokio::test]
    async fn stream_emits_chunks_then_usage_frame() {
        let adapter = ScriptedAdapter::new(Behavior::Stream {
            chunks: vec!["Hel", "lo"],
            usage: Some(crate::models::capability::TokenUsage {
                prompt_tokens: 4,
                completion_tokens: 2,
            }),
            then_fail: false,
        });
        let t = setup(|_| {}, adapter).await;
        let mut req = call("/capability/text.generation/stream", r#"{"prompt":"x"}"#);
        req.headers_mut()
            .insert("x-request-id", "stream-1".parse().unwrap());

        let resp = t.app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let chunk_at = text.find("event: chunk").unwrap();
        let usage_at = text.find("event: usage").unwrap();
        assert!(chunk_at < usage_at);
        assert!(text.contains(r#""requestId":"stream-1""#));

        let records = t.store.wait_for_usage(1).await;
        assert_eq!(records.len(), 1);
        assert!(records[0].is_stream);
        assert_eq!(records[0].request_id, "stream-1");
    }
}
