//! In-memory [`ConfigSource`] + [`UsageStore`] used by the test suites.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::capability::CapabilityType;
use crate::models::client::{CapabilityPermission, Client, ClientId};
use crate::models::model_config::ModelConfig;
use crate::models::usage_record::{NewUsageRecord, UsageRecord, UsageStatus};
use crate::services::store::{ConfigSource, UsageStore};

#[derive(Default)]
pub struct MemoryStore {
    clients: Mutex<Vec<Client>>,
    permissions: Mutex<Vec<CapabilityPermission>>,
    models: Mutex<Vec<ModelConfig>>,
    usage: Mutex<Vec<UsageRecord>>,
    fail_config_loads: AtomicBool,
}

impl MemoryStore {
    pub fn put_client(&self, client: Client) {
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|c| c.id != client.id);
        clients.push(client);
    }

    pub fn put_permission(&self, permission: CapabilityPermission) {
        let mut permissions = self.permissions.lock().unwrap();
        permissions.retain(|p| {
            !(p.client_id == permission.client_id
                && p.capability_type == permission.capability_type)
        });
        permissions.push(permission);
    }

    pub fn put_model(&self, model: ModelConfig) {
        let mut models = self.models.lock().unwrap();
        models.retain(|m| m.id != model.id);
        models.push(model);
    }

    pub fn fail_config_loads(&self, fail: bool) {
        self.fail_config_loads.store(fail, Ordering::SeqCst);
    }

    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage.lock().unwrap().clone()
    }

    pub fn count_with_status(&self, status: UsageStatus) -> usize {
        self.usage
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.status == status)
            .count()
    }

    /// Wait for spawned recorder tasks to land `n` records.
    pub async fn wait_for_usage(&self, n: usize) -> Vec<UsageRecord> {
        for _ in 0..200 {
            let records = self.usage_records();
            if records.len() >= n {
                return records;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        self.usage_records()
    }

    /// Insert a record with an explicit timestamp, for quota window tests.
    pub fn push_usage_at(&self, record: NewUsageRecord, created_at: DateTime<Utc>) {
        self.usage
            .lock()
            .unwrap()
            .push(record.into_record(Uuid::new_v4(), created_at));
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.fail_config_loads.load(Ordering::SeqCst) {
            return Err(AppError::Internal("config source unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigSource for MemoryStore {
    async fn load_clients(&self) -> Result<Vec<Client>, AppError> {
        self.check_available()?;
        Ok(self.clients.lock().unwrap().clone())
    }

    async fn load_permissions(&self) -> Result<Vec<CapabilityPermission>, AppError> {
        self.check_available()?;
        Ok(self.permissions.lock().unwrap().clone())
    }

    async fn load_model_configs(&self) -> Result<Vec<ModelConfig>, AppError> {
        self.check_available()?;
        Ok(self.models.lock().unwrap().clone())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn append(&self, record: NewUsageRecord) -> Result<(), AppError> {
        self.push_usage_at(record, Utc::now());
        Ok(())
    }

    async fn cost_since(
        &self,
        client_id: ClientId,
        capability: &CapabilityType,
        since: DateTime<Utc>,
    ) -> Result<f64, AppError> {
        Ok(self
            .usage
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                r.client_id == client_id
                    && &r.capability_type == capability
                    && r.created_at >= since
            })
            .map(|r| r.cost)
            .sum())
    }
}

pub mod fixtures {
    use super::*;
    use crate::models::capability::TokenUsage;
    use crate::models::client::ClientStatus;

    pub fn text_generation() -> CapabilityType {
        CapabilityType::parse(CapabilityType::TEXT_GENERATION).unwrap()
    }

    pub fn client(api_key: &str, stored_secret: &str, status: ClientStatus) -> Client {
        let now = Utc::now();
        Client {
            id: Uuid::new_v4(),
            name: format!("client {api_key}"),
            api_key: api_key.to_string(),
            api_secret_hash: stored_secret.to_string(),
            status,
            created_at: now,
            updated_at: now,
        }
    }

    /// Enabled, unrestricted, unlimited permission.
    pub fn permission(client_id: ClientId, capability: &CapabilityType) -> CapabilityPermission {
        CapabilityPermission {
            id: Uuid::new_v4(),
            client_id,
            capability_type: capability.clone(),
            enabled: true,
            rate_limit_per_minute: 0,
            quota_limit: None,
            monthly_quota_limit: None,
            preferred_provider: None,
            allowed_providers: vec![],
            allowed_models: vec![],
            priority: 1,
        }
    }

    pub fn model(capability: &CapabilityType, provider: &str, model: &str, priority: i32) -> ModelConfig {
        let now = Utc::now();
        ModelConfig {
            id: Uuid::new_v4(),
            capability_type: capability.clone(),
            provider: provider.to_string(),
            model: model.to_string(),
            enabled: true,
            priority,
            endpoint: "http://127.0.0.1:9".into(),
            credential: "test-credential".into(),
            timeout_ms: 1_000,
            retries: 1,
            input_cost_per_1k: 1.0,
            output_cost_per_1k: 2.0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn spend(client_id: ClientId, capability: &CapabilityType, cost: f64) -> NewUsageRecord {
        NewUsageRecord {
            client_id,
            request_id: Uuid::new_v4().to_string(),
            capability_type: capability.clone(),
            provider: "openai".into(),
            model: "gpt-a".into(),
            status: UsageStatus::Success,
            usage: TokenUsage::default(),
            cost,
            response_time_ms: 10,
            is_stream: false,
            error_message: None,
        }
    }
}
