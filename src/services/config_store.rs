//! In-memory cache of the routing configuration.
//!
//! Requests read an immutable [`ConfigSnapshot`] without locking. The snapshot
//! is rebuilt from the [`ConfigSource`] every refresh interval, or sooner when
//! [`ConfigStore::invalidate`] is called. Between refreshes, a just-disabled
//! model config or client may keep being served: staleness is bounded by the
//! refresh interval and accepted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::AppError;
use crate::models::capability::CapabilityType;
use crate::models::client::{CapabilityPermission, Client, ClientId};
use crate::models::model_config::ModelConfig;
use crate::services::store::ConfigSource;

#[derive(Debug, Default)]
pub struct ConfigSnapshot {
    clients_by_key: HashMap<String, Client>,
    permissions: HashMap<(ClientId, CapabilityType), CapabilityPermission>,
    /// Every config per capability (enabled or not), ordered by id.
    models: HashMap<CapabilityType, Vec<ModelConfig>>,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl ConfigSnapshot {
    pub fn build(
        clients: Vec<Client>,
        permissions: Vec<CapabilityPermission>,
        models: Vec<ModelConfig>,
    ) -> Self {
        let clients_by_key = clients
            .into_iter()
            .map(|c| (c.api_key.clone(), c))
            .collect();

        let mut by_key = HashMap::with_capacity(permissions.len());
        for p in permissions {
            let key = (p.client_id, p.capability_type.clone());
            if by_key.contains_key(&key) {
                tracing::warn!(
                    client_id = %p.client_id,
                    capability = %p.capability_type,
                    "Duplicate capability permission ignored"
                );
                continue;
            }
            by_key.insert(key, p);
        }

        let mut grouped: HashMap<CapabilityType, Vec<ModelConfig>> = HashMap::new();
        for m in models {
            grouped.entry(m.capability_type.clone()).or_default().push(m);
        }
        for configs in grouped.values_mut() {
            configs.sort_by_key(|m| m.id);
        }

        Self {
            clients_by_key,
            permissions: by_key,
            models: grouped,
            loaded_at: Some(Utc::now()),
        }
    }

    pub fn client_by_key(&self, api_key: &str) -> Option<&Client> {
        self.clients_by_key.get(api_key)
    }

    pub fn permission(
        &self,
        client_id: ClientId,
        capability: &CapabilityType,
    ) -> Option<&CapabilityPermission> {
        self.permissions.get(&(client_id, capability.clone()))
    }

    pub fn model_configs(&self, capability: &CapabilityType) -> &[ModelConfig] {
        self.models.get(capability).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn client_count(&self) -> usize {
        self.clients_by_key.len()
    }

    pub fn model_count(&self) -> usize {
        self.models.values().map(Vec::len).sum()
    }
}

pub struct ConfigStore {
    source: Arc<dyn ConfigSource>,
    current: ArcSwap<ConfigSnapshot>,
    invalidated: Notify,
}

impl ConfigStore {
    /// Build the store and perform the initial load. Fails if the source is unreachable.
    pub async fn load(source: Arc<dyn ConfigSource>) -> Result<Self, AppError> {
        let store = Self {
            source,
            current: ArcSwap::from_pointee(ConfigSnapshot::default()),
            invalidated: Notify::new(),
        };
        store.refresh().await?;
        Ok(store)
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Reload everything from the source and swap the snapshot in atomically.
    /// On failure the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<(), AppError> {
        let (clients, permissions, models) = tokio::try_join!(
            self.source.load_clients(),
            self.source.load_permissions(),
            self.source.load_model_configs(),
        )?;

        let snapshot = ConfigSnapshot::build(clients, permissions, models);
        tracing::debug!(
            clients = snapshot.client_count(),
            models = snapshot.model_count(),
            "Config snapshot refreshed"
        );
        self.current.store(Arc::new(snapshot));
        Ok(())
    }

    /// Ask the background task to refresh now instead of waiting for the next tick.
    pub fn invalidate(&self) {
        self.invalidated.notify_one();
    }

    pub fn spawn_refresh_task(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the initial load already happened.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.invalidated.notified() => {
                        ticker.reset();
                    }
                }
                if let Err(e) = self.refresh().await {
                    tracing::error!("Config refresh failed, serving previous snapshot: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::client::ClientStatus;
    use crate::services::memory_store::{fixtures, MemoryStore};

    #[tokio::test]
    async fn snapshot_indexes_clients_permissions_and_models() {
        let store = Arc::new(MemoryStore::default());
        let client = fixtures::client("k", "s", ClientStatus::Active);
        let cap = fixtures::text_generation();
        store.put_permission(fixtures::permission(client.id, &cap));
        store.put_model(fixtures::model(&cap, "openai", "gpt-a", 1));
        store.put_model(fixtures::model(&cap, "openai", "gpt-b", 2));
        let client_id = client.id;
        store.put_client(client);

        let config = ConfigStore::load(store).await.unwrap();
        let snap = config.snapshot();
        assert!(snap.client_by_key("k").is_some());
        assert!(snap.permission(client_id, &cap).is_some());
        assert_eq!(snap.model_configs(&cap).len(), 2);
        let other = CapabilityType::parse("image.generation").unwrap();
        assert!(snap.model_configs(&other).is_empty());
    }

    #[tokio::test]
    async fn reads_are_stale_until_refresh() {
        let store = Arc::new(MemoryStore::default());
        let cap = fixtures::text_generation();
        let config = ConfigStore::load(store.clone()).await.unwrap();

        store.put_model(fixtures::model(&cap, "openai", "gpt-a", 1));
        assert!(config.snapshot().model_configs(&cap).is_empty());

        config.refresh().await.unwrap();
        assert_eq!(config.snapshot().model_configs(&cap).len(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let store = Arc::new(MemoryStore::default());
        let cap = fixtures::text_generation();
        store.put_model(fixtures::model(&cap, "openai", "gpt-a", 1));
        let config = ConfigStore::load(store.clone()).await.unwrap();

        store.fail_config_loads(true);
        assert!(config.refresh().await.is_err());
        assert_eq!(config.snapshot().model_configs(&cap).len(), 1);
    }

    #[tokio::test]
    async fn invalidate_triggers_background_refresh() {
        let store = Arc::new(MemoryStore::default());
        let cap = fixtures::text_generation();
        let config = Arc::new(ConfigStore::load(store.clone()).await.unwrap());
        let task = config.clone().spawn_refresh_task(Duration::from_secs(3600));

        store.put_model(fixtures::model(&cap, "openai", "gpt-a", 1));
        config.invalidate();

        let mut refreshed = false;
        for _ in 0..100 {
            if !config.snapshot().model_configs(&cap).is_empty() {
                refreshed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();
        assert!(refreshed);
    }

    #[test]
    fn duplicate_permissions_keep_the_first_row() {
        let client = fixtures::client("k", "s", ClientStatus::Active);
        let cap = fixtures::text_generation();
        let mut first = fixtures::permission(client.id, &cap);
        first.priority = 1;
        let mut second = fixtures::permission(client.id, &cap);
        second.priority = 2;

        let snap = ConfigSnapshot::build(vec![client.clone()], vec![first, second], vec![]);
        assert_eq!(snap.permission(client.id, &cap).unwrap().priority, 1);
    }
}
