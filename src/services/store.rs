//! Read/write contracts the routing core needs from persistence.
//!
//! The core only sees these traits; [`PgStore`] binds them to Postgres via
//! the query functions in the `*_service` modules.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::AppError;
use crate::models::capability::CapabilityType;
use crate::models::client::{CapabilityPermission, Client, ClientId};
use crate::models::model_config::ModelConfig;
use crate::models::usage_record::NewUsageRecord;
use crate::services::{client_service, model_service, usage_service};

/// Source of the configuration rows cached by the `ConfigStore`.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load_clients(&self) -> Result<Vec<Client>, AppError>;
    async fn load_permissions(&self) -> Result<Vec<CapabilityPermission>, AppError>;
    async fn load_model_configs(&self) -> Result<Vec<ModelConfig>, AppError>;
}

/// Append-only usage history.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn append(&self, record: NewUsageRecord) -> Result<(), AppError>;

    /// Sum of `cost` for one client and capability since `since` (inclusive).
    async fn cost_since(
        &self,
        client_id: ClientId,
        capability: &CapabilityType,
        since: DateTime<Utc>,
    ) -> Result<f64, AppError>;
}

#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConfigSource for PgStore {
    async fn load_clients(&self) -> Result<Vec<Client>, AppError> {
        client_service::list_clients(&self.db).await
    }

    async fn load_permissions(&self) -> Result<Vec<CapabilityPermission>, AppError> {
        client_service::list_all_permissions(&self.db).await
    }

    async fn load_model_configs(&self) -> Result<Vec<ModelConfig>, AppError> {
        model_service::list_model_configs(&self.db).await
    }
}

#[async_trait]
impl UsageStore for PgStore {
    async fn append(&self, record: NewUsageRecord) -> Result<(), AppError> {
        usage_service::insert_usage(&self.db, record).await
    }

    async fn cost_since(
        &self,
        client_id: ClientId,
        capability: &CapabilityType,
        since: DateTime<Utc>,
    ) -> Result<f64, AppError> {
        usage_service::sum_cost_since(&self.db, client_id, capability, since).await
    }
}
