//! One usage record per provider attempt, successful or not.
//!
//! Buffered attempts are recorded inline. Streamed attempts are wrapped in a
//! [`MeteredStream`] that records once the provider stream ends, fails, or is
//! dropped by a disconnecting client, off the response path.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::Instant;

use crate::models::capability::{
    CapabilityRequest, CapabilityType, Cost, StreamEvent, TokenUsage, UsageFrame,
};
use crate::models::client::ClientId;
use crate::models::model_config::ModelConfig;
use crate::models::usage_record::{NewUsageRecord, UsageStatus};
use crate::services::provider_adapter::{ChunkStream, ProviderError};
use crate::services::store::UsageStore;

/// Rough chars-per-token ratio for providers that do not report usage.
const CHARS_PER_TOKEN: usize = 4;

pub fn estimate_tokens(chars: usize) -> u32 {
    u32::try_from(chars.div_ceil(CHARS_PER_TOKEN)).unwrap_or(u32::MAX)
}

/// What every record of one routed request shares.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub client_id: ClientId,
    pub request_id: String,
    pub capability: CapabilityType,
    pub is_stream: bool,
    /// Used when the provider never reports prompt tokens.
    pub prompt_estimate: u32,
}

impl AttemptContext {
    pub fn new(
        client_id: ClientId,
        capability: &CapabilityType,
        request: &CapabilityRequest,
        is_stream: bool,
    ) -> Self {
        let prompt_chars = request.messages.iter().map(|m| m.content.chars().count()).sum();
        Self {
            client_id,
            request_id: request.request_id.clone(),
            capability: capability.clone(),
            is_stream,
            prompt_estimate: estimate_tokens(prompt_chars),
        }
    }
}

fn elapsed_ms(elapsed: Duration) -> i32 {
    i32::try_from(elapsed.as_millis()).unwrap_or(i32::MAX)
}

#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn UsageStore>,
    currency: String,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn UsageStore>, currency: impl Into<String>) -> Self {
        Self {
            store,
            currency: currency.into(),
        }
    }

    fn build(
        &self,
        ctx: &AttemptContext,
        target: &ModelConfig,
        status: UsageStatus,
        usage: TokenUsage,
        elapsed: Duration,
        error_message: Option<String>,
    ) -> NewUsageRecord {
        NewUsageRecord {
            client_id: ctx.client_id,
            request_id: ctx.request_id.clone(),
            capability_type: ctx.capability.clone(),
            provider: target.provider.clone(),
            model: target.model.clone(),
            status,
            usage,
            cost: target.pricing().cost_of(&usage),
            response_time_ms: elapsed_ms(elapsed),
            is_stream: ctx.is_stream,
            error_message,
        }
    }

    /// Losing a record must not fail the request it describes.
    async fn append(&self, record: NewUsageRecord) {
        if let Err(e) = self.store.append(record).await {
            tracing::error!("Failed to insert usage record: {}", e);
        }
    }

    pub async fn record_success(
        &self,
        ctx: &AttemptContext,
        target: &ModelConfig,
        usage: TokenUsage,
        elapsed: Duration,
    ) -> Cost {
        let record = self.build(ctx, target, UsageStatus::Success, usage, elapsed, None);
        let cost = Cost {
            amount: record.cost,
            currency: self.currency.clone(),
        };
        self.append(record).await;
        cost
    }

    pub async fn record_failure(
        &self,
        ctx: &AttemptContext,
        target: &ModelConfig,
        error: &ProviderError,
        elapsed: Duration,
    ) {
        let record = self.build(
            ctx,
            target,
            UsageStatus::Failure,
            TokenUsage::default(),
            elapsed,
            Some(error.to_string()),
        );
        self.append(record).await;
    }

    /// Wrap an established provider stream so its usage is recorded exactly once.
    /// A provider that stays silent longer than the backend timeout between
    /// chunks fails the stream.
    pub fn meter(
        &self,
        ctx: AttemptContext,
        target: ModelConfig,
        started: Instant,
        inner: ChunkStream,
    ) -> MeteredStream {
        let idle = target.timeout();
        let inner: ChunkStream = tokio_stream::StreamExt::timeout(inner, idle)
            .map(move |item| item.unwrap_or(Err(ProviderError::Timeout(idle))))
            .boxed();
        MeteredStream {
            inner,
            recorder: self.clone(),
            ctx,
            target,
            started,
            reported: None,
            delivered_chars: 0,
            finished: false,
        }
    }
}

/// Provider chunks out as [`StreamEvent`]s, closed by one usage or error frame.
pub struct MeteredStream {
    inner: ChunkStream,
    recorder: UsageRecorder,
    ctx: AttemptContext,
    target: ModelConfig,
    started: Instant,
    reported: Option<TokenUsage>,
    delivered_chars: usize,
    finished: bool,
}

impl MeteredStream {
    /// Provider-reported usage if any, otherwise an estimate from what was sent.
    fn observed_usage(&self) -> TokenUsage {
        self.reported.unwrap_or(TokenUsage {
            prompt_tokens: self.ctx.prompt_estimate,
            completion_tokens: estimate_tokens(self.delivered_chars),
        })
    }

    fn finalize(&mut self, status: UsageStatus, error_message: Option<String>) -> (TokenUsage, Cost) {
        self.finished = true;
        let usage = self.observed_usage();
        let record = self.recorder.build(
            &self.ctx,
            &self.target,
            status,
            usage,
            self.started.elapsed(),
            error_message,
        );
        let cost = Cost {
            amount: record.cost,
            currency: self.recorder.currency.clone(),
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let recorder = self.recorder.clone();
                handle.spawn(async move { recorder.append(record).await });
            }
            Err(_) => tracing::error!(
                request_id = %self.ctx.request_id,
                "No runtime available, stream usage record lost"
            ),
        }
        (usage, cost)
    }
}

impl Stream for MeteredStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    if chunk.usage.is_some() {
                        this.reported = chunk.usage;
                    }
                    if chunk.text.is_empty() {
                        continue;
                    }
                    this.delivered_chars += chunk.text.chars().count();
                    return Poll::Ready(Some(StreamEvent::Chunk(chunk.text)));
                }
                Poll::Ready(Some(Err(e))) => {
                    tracing::warn!(
                        request_id = %this.ctx.request_id,
                        provider = %this.target.provider,
                        model = %this.target.model,
                        "Provider stream failed mid-response: {}",
                        e
                    );
                    this.finalize(UsageStatus::Failure, Some(e.to_string()));
                    return Poll::Ready(Some(StreamEvent::Error {
                        kind: "provider_error",
                        message: "provider stream interrupted".into(),
                    }));
                }
                Poll::Ready(None) => {
                    let (usage, cost) = this.finalize(UsageStatus::Success, None);
                    return Poll::Ready(Some(StreamEvent::Usage(UsageFrame {
                        model: this.target.model.clone(),
                        provider: this.target.provider.clone(),
                        usage,
                        cost,
                        request_id: this.ctx.request_id.clone(),
                    })));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for MeteredStream {
    fn drop(&mut self) {
        if !self.finished {
            tracing::info!(
                request_id = %self.ctx.request_id,
                "Stream closed before completion, recording partial usage"
            );
            self.finalize(
                UsageStatus::Failure,
                Some("stream cancelled before completion".into()),
            );
        }
    }
}
