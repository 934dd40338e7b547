use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::error::AppError;
use crate::services::capability_router::CapabilityRouter;
use crate::services::config_store::ConfigStore;
use crate::services::credential_gate::CredentialGate;
use crate::services::provider_adapter::AdapterRegistry;
use crate::services::quota_limiter::QuotaLimiter;
use crate::services::rate_limiter::RateLimiter;
use crate::services::store::{ConfigSource, UsageStore};
use crate::services::usage_recorder::UsageRecorder;

pub struct AppState {
    pub config: Config,
    /// Admin API only; the routing path goes through the store traits.
    pub db: PgPool,
    pub config_store: Arc<ConfigStore>,
    pub credentials: CredentialGate,
    pub quota: QuotaLimiter,
    pub router: CapabilityRouter,
}

impl AppState {
    /// Wire the routing core. Performs the initial config load.
    pub async fn build(
        config: Config,
        db: PgPool,
        source: Arc<dyn ConfigSource>,
        usage: Arc<dyn UsageStore>,
        rate: Arc<dyn RateLimiter>,
        adapters: AdapterRegistry,
    ) -> Result<Self, AppError> {
        let config_store = Arc::new(ConfigStore::load(source).await?);
        let recorder = UsageRecorder::new(usage.clone(), config.billing_currency.clone());

        Ok(Self {
            credentials: CredentialGate::new(config_store.clone(), config.credential_mode),
            quota: QuotaLimiter::new(rate, usage),
            router: CapabilityRouter::new(
                config_store.clone(),
                Arc::new(adapters),
                recorder,
                config.max_attempts_per_request,
            ),
            config_store,
            config,
            db,
        })
    }

    /// Called after every admin mutation so routing sees it without waiting
    /// for the next tick.
    pub async fn reload_config(&self) {
        if let Err(e) = self.config_store.refresh().await {
            tracing::error!("Config reload after admin change failed: {}", e);
            self.config_store.invalidate();
        }
    }
}

#[cfg(test)]
impl AppState {
    /// State backed by a [`MemoryStore`]. The pool never connects; tests that
    /// reach the admin SQL paths need a real database.
    pub async fn for_tests(
        store: Arc<crate::services::memory_store::MemoryStore>,
        adapters: AdapterRegistry,
    ) -> Arc<Self> {
        let config = Config::for_tests();
        let db = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy(&config.database_url)
            .unwrap();
        let state = Self::build(
            config,
            db,
            store.clone(),
            store,
            Arc::new(crate::services::rate_limiter::MemoryRateLimiter::new()),
            adapters,
        )
        .await
        .unwrap();
        Arc::new(state)
    }
}
