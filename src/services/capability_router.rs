//! Resolve a capability request to an ordered list of backends and walk it.
//!
//! Every attempt is recorded before the next one starts, so a request that
//! fails over k times and then succeeds leaves k+1 usage records.

use std::cmp::Ordering;
use std::sync::Arc;

use futures::StreamExt;
use tokio::time::Instant;

use crate::error::AppError;
use crate::models::capability::{CapabilityRequest, CapabilityResponse, CapabilityType};
use crate::models::client::{CapabilityPermission, ClientId};
use crate::models::model_config::ModelConfig;
use crate::services::config_store::ConfigStore;
use crate::services::provider_adapter::{
    AdapterRegistry, ChunkStream, ProviderAdapter, ProviderError, ProviderResponse,
};
use crate::services::usage_recorder::{AttemptContext, MeteredStream, UsageRecorder};

/// Order the backends a permission may use, best first.
///
/// With a model hint only configs serving that model are kept, and an
/// unsatisfiable hint is an error rather than a silent fallback. Without a
/// hint the preferred provider's configs come first. Then config priority
/// (higher first), then provider, model and id so equal-priority ties resolve
/// the same way on every call. The permission's own priority is constant
/// within one request and cannot reorder candidates.
pub fn select_candidates(
    configs: &[ModelConfig],
    permission: &CapabilityPermission,
    model_hint: Option<&str>,
) -> Result<Vec<ModelConfig>, AppError> {
    let mut candidates: Vec<ModelConfig> = configs
        .iter()
        .filter(|m| {
            m.enabled && permission.allows_provider(&m.provider) && permission.allows_model(&m.model)
        })
        .cloned()
        .collect();

    if let Some(hint) = model_hint {
        candidates.retain(|m| m.model == hint);
        if candidates.is_empty() {
            return Err(AppError::ModelNotAllowed(hint.to_string()));
        }
    }

    // An explicit model choice is already ranked by priority alone.
    let preferred = match model_hint {
        Some(_) => None,
        None => permission.preferred_provider.as_deref(),
    };
    let is_preferred = |m: &ModelConfig| preferred.is_some_and(|p| p.eq_ignore_ascii_case(&m.provider));

    candidates.sort_by(|a, b| {
        is_preferred(b)
            .cmp(&is_preferred(a))
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| a.provider.cmp(&b.provider))
            .then_with(|| a.model.cmp(&b.model))
            .then_with(|| a.id.cmp(&b.id))
    });

    Ok(candidates)
}

/// Attempts allowed for one walk: one initial try plus each candidate's
/// retries, bounded by the gateway cap and by the candidate count since no
/// backend is tried twice.
pub fn attempt_budget(candidates: &[ModelConfig], max_attempts: usize) -> usize {
    let retries: usize = candidates
        .iter()
        .map(|m| usize::try_from(m.retries).unwrap_or(0))
        .sum();
    (1 + retries).min(max_attempts).min(candidates.len())
}

/// An established stream plus the backend serving it.
pub struct RoutedStream {
    pub provider: String,
    pub model: String,
    pub events: MeteredStream,
}

pub struct CapabilityRouter {
    config: Arc<ConfigStore>,
    adapters: Arc<AdapterRegistry>,
    recorder: UsageRecorder,
    max_attempts: usize,
}

impl CapabilityRouter {
    pub fn new(
        config: Arc<ConfigStore>,
        adapters: Arc<AdapterRegistry>,
        recorder: UsageRecorder,
        max_attempts: usize,
    ) -> Self {
        Self {
            config,
            adapters,
            recorder,
            max_attempts: max_attempts.max(1),
        }
    }

    /// The enabled permission for (client, capability), or `CapabilityDisabled`.
    pub fn permission_for(
        &self,
        client_id: ClientId,
        capability: &CapabilityType,
    ) -> Result<CapabilityPermission, AppError> {
        self.config
            .snapshot()
            .permission(client_id, capability)
            .filter(|p| p.enabled)
            .cloned()
            .ok_or_else(|| AppError::CapabilityDisabled(capability.clone()))
    }

    pub fn candidates(
        &self,
        permission: &CapabilityPermission,
        model_hint: Option<&str>,
    ) -> Result<Vec<ModelConfig>, AppError> {
        let snapshot = self.config.snapshot();
        let candidates = select_candidates(
            snapshot.model_configs(&permission.capability_type),
            permission,
            model_hint,
        )?;
        if candidates.is_empty() {
            tracing::warn!(
                client_id = %permission.client_id,
                capability = %permission.capability_type,
                "No enabled backend matches the permission"
            );
            return Err(AppError::NoAvailableBackend { attempts: 0 });
        }
        Ok(candidates)
    }

    fn adapter_for(&self, target: &ModelConfig) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        self.adapters
            .get(&target.provider)
            .ok_or_else(|| ProviderError::Unsupported(target.provider.clone()))
    }

    async fn invoke_once(
        &self,
        target: &ModelConfig,
        request: &CapabilityRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let adapter = self.adapter_for(target)?;
        let timeout = target.timeout();
        tokio::time::timeout(timeout, adapter.invoke(target, request))
            .await
            .map_err(|_| ProviderError::Timeout(timeout))?
    }

    /// Establish a stream and wait for its first item, all within the
    /// backend's timeout. Failures up to that point are still failover-able.
    async fn open_stream(
        &self,
        target: &ModelConfig,
        request: &CapabilityRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let adapter = self.adapter_for(target)?;
        let timeout = target.timeout();
        let opened = async {
            let mut stream = adapter.stream(target, request).await?;
            match stream.next().await {
                Some(Ok(first)) => Ok::<ChunkStream, ProviderError>(
                    futures::stream::once(async move { Ok(first) })
                        .chain(stream)
                        .boxed(),
                ),
                Some(Err(e)) => Err(e),
                None => Ok(futures::stream::empty().boxed()),
            }
        };
        tokio::time::timeout(timeout, opened)
            .await
            .map_err(|_| ProviderError::Timeout(timeout))?
    }

    /// Buffered dispatch: walk candidates until one answers.
    pub async fn dispatch(
        &self,
        client_id: ClientId,
        permission: &CapabilityPermission,
        request: &CapabilityRequest,
    ) -> Result<CapabilityResponse, AppError> {
        let candidates = self.candidates(permission, request.model_hint.as_deref())?;
        let budget = attempt_budget(&candidates, self.max_attempts);
        let ctx = AttemptContext::new(client_id, &permission.capability_type, request, false);

        for (attempt, target) in candidates.iter().take(budget).enumerate() {
            let started = Instant::now();
            match self.invoke_once(target, request).await {
                Ok(resp) => {
                    let cost = self
                        .recorder
                        .record_success(&ctx, target, resp.usage, started.elapsed())
                        .await;
                    tracing::info!(
                        request_id = %request.request_id,
                        provider = %target.provider,
                        model = %target.model,
                        attempt = attempt + 1,
                        "Capability request served"
                    );
                    return Ok(CapabilityResponse {
                        text: resp.text,
                        model: target.model.clone(),
                        provider: target.provider.clone(),
                        usage: resp.usage,
                        cost,
                        request_id: request.request_id.clone(),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        request_id = %request.request_id,
                        provider = %target.provider,
                        model = %target.model,
                        attempt = attempt + 1,
                        "Provider attempt failed: {}",
                        e
                    );
                    self.recorder
                        .record_failure(&ctx, target, &e, started.elapsed())
                        .await;
                }
            }
        }

        Err(AppError::NoAvailableBackend { attempts: budget })
    }

    /// Streaming dispatch. Failover is only possible until the first chunk
    /// arrives; after that the returned stream is committed to one backend.
    pub async fn dispatch_stream(
        &self,
        client_id: ClientId,
        permission: &CapabilityPermission,
        request: &CapabilityRequest,
    ) -> Result<RoutedStream, AppError> {
        let candidates = self.candidates(permission, request.model_hint.as_deref())?;
        let budget = attempt_budget(&candidates, self.max_attempts);
        let ctx = AttemptContext::new(client_id, &permission.capability_type, request, true);

        for (attempt, target) in candidates.iter().take(budget).enumerate() {
            let started = Instant::now();
            match self.open_stream(target, request).await {
                Ok(stream) => {
                    tracing::info!(
                        request_id = %request.request_id,
                        provider = %target.provider,
                        model = %target.model,
                        attempt = attempt + 1,
                        "Capability stream established"
                    );
                    let events = self
                        .recorder
                        .meter(ctx.clone(), target.clone(), started, stream);
                    return Ok(RoutedStream {
                        provider: target.provider.clone(),
                        model: target.model.clone(),
                        events,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        request_id = %request.request_id,
                        provider = %target.provider,
                        model = %target.model,
                        attempt = attempt + 1,
                        "Provider stream attempt failed: {}",
                        e
                    );
                    self.recorder
                        .record_failure(&ctx, target, &e, started.elapsed())
                        .await;
                }
            }
        }

        Err(AppError::NoAvailableBackend { attempts: budget })
    }
}

/// Used by admin listings to show configs in routing order.
pub fn routing_order(a: &ModelConfig, b: &ModelConfig) -> Ordering {
    a.capability_type
        .cmp(&b.capability_type)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.provider.cmp(&b.provider))
        .then_with(|| a.model.cmp(&b.model))
}
