use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::capability::{CapabilityType, TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Pricing {
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
}

impl Pricing {
    pub fn cost_of(&self, usage: &TokenUsage) -> f64 {
        f64::from(usage.prompt_tokens) / 1000.0 * self.input_cost_per_1k
            + f64::from(usage.completion_tokens) / 1000.0 * self.output_cost_per_1k
    }
}

/// One routable backend. Unique per (capability_type, provider, model).
#[derive(Debug, Clone, FromRow)]
pub struct ModelConfig {
    pub id: Uuid,
    pub capability_type: CapabilityType,
    pub provider: String,
    pub model: String,
    pub enabled: bool,
    /// Higher = preferred
    pub priority: i32,
    /// Provider base URL (e.g. "https://api.openai.com/v1")
    pub endpoint: String,
    pub credential: String,
    pub timeout_ms: i64,
    /// Failover attempts this backend contributes to a routing walk.
    pub retries: i32,
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelConfig {
    pub fn pricing(&self) -> Pricing {
        Pricing {
            input_cost_per_1k: self.input_cost_per_1k,
            output_cost_per_1k: self.output_cost_per_1k,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1) as u64)
    }
}

/// Admin payload for creating a model config.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfigSpec {
    pub capability_type: String,
    pub provider: String,
    pub model: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    /// Optional for known provider kinds; defaults to the kind's base URL.
    pub endpoint: Option<String>,
    pub credential: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: i64,
    #[serde(default = "default_retries")]
    pub retries: i32,
    #[serde(default)]
    pub input_cost_per_1k: f64,
    #[serde(default)]
    pub output_cost_per_1k: f64,
}

/// Admin payload for a partial update. Absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelConfigPatch {
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
    pub endpoint: Option<String>,
    pub credential: Option<String>,
    pub timeout_ms: Option<i64>,
    pub retries: Option<i32>,
    pub input_cost_per_1k: Option<f64>,
    pub output_cost_per_1k: Option<f64>,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_ms() -> i64 {
    30_000
}

fn default_retries() -> i32 {
    1
}

/// Public info returned by the admin API — never exposes the full credential.
#[derive(Debug, Serialize)]
pub struct ModelConfigInfo {
    pub id: Uuid,
    pub capability_type: CapabilityType,
    pub provider: String,
    pub model: String,
    pub enabled: bool,
    pub priority: i32,
    pub endpoint: String,
    pub credential_preview: String,
    pub timeout_ms: i64,
    pub retries: i32,
    pub pricing: Pricing,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ModelConfig> for ModelConfigInfo {
    fn from(m: ModelConfig) -> Self {
        let preview = if m.credential.chars().count() > 8 {
            let head: String = m.credential.chars().take(4).collect();
            let mut tail: Vec<char> = m.credential.chars().rev().take(4).collect();
            tail.reverse();
            format!("{}...{}", head, tail.into_iter().collect::<String>())
        } else {
            "****".to_string()
        };
        let pricing = m.pricing();
        Self {
            id: m.id,
            capability_type: m.capability_type,
            provider: m.provider,
            model: m.model,
            enabled: m.enabled,
            priority: m.priority,
            endpoint: m.endpoint,
            credential_preview: preview,
            timeout_ms: m.timeout_ms,
            retries: m.retries,
            pricing,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory_store::fixtures;

    #[test]
    fn cost_is_per_thousand_tokens() {
        let pricing = Pricing {
            input_cost_per_1k: 0.5,
            output_cost_per_1k: 1.5,
        };
        let usage = TokenUsage {
            prompt_tokens: 2000,
            completion_tokens: 500,
        };
        assert!((pricing.cost_of(&usage) - 1.75).abs() < 1e-9);
    }

    fn config_with_credential(credential: &str) -> ModelConfig {
        let cap = fixtures::text_generation();
        let mut config = fixtures::model(&cap, "openai", "gpt-a", 1);
        config.credential = credential.into();
        config
    }

    #[test]
    fn credential_preview_keeps_only_the_ends() {
        let info = ModelConfigInfo::from(config_with_credential("sk-abcdef123456"));
        assert_eq!(info.credential_preview, "sk-a...3456");

        let short = ModelConfigInfo::from(config_with_credential("short"));
        assert_eq!(short.credential_preview, "****");
    }

    #[test]
    fn credential_preview_handles_multibyte_characters() {
        let info = ModelConfigInfo::from(config_with_credential("ké€y-0123456789€"));
        assert_eq!(info.credential_preview, "ké€y...789€");
    }
}
