use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::capability::CapabilityType;

pub type ClientId = Uuid;

/// Lifecycle state of a client. Only `Active` clients may route.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Active,
    Suspended,
    Inactive,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown client status: {0}")]
pub struct UnknownStatus(String);

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Active => "active",
            ClientStatus::Suspended => "suspended",
            ClientStatus::Inactive => "inactive",
        }
    }
}

impl TryFrom<String> for ClientStatus {
    type Error = UnknownStatus;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "active" => Ok(ClientStatus::Active),
            "suspended" => Ok(ClientStatus::Suspended),
            "inactive" => Ok(ClientStatus::Inactive),
            _ => Err(UnknownStatus(s)),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    pub api_key: String,
    /// SHA-256 hex digest in hashed credential mode, the raw secret in plain mode.
    pub api_secret_hash: String,
    #[sqlx(try_from = "String")]
    pub status: ClientStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Client {
    pub fn is_active(&self) -> bool {
        self.status == ClientStatus::Active
    }
}

/// Response when listing clients — never exposes the secret.
#[derive(Debug, Serialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub name: String,
    pub api_key: String,
    pub status: ClientStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Client> for ClientInfo {
    fn from(c: Client) -> Self {
        Self {
            id: c.id,
            name: c.name,
            api_key: c.api_key,
            status: c.status,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

/// Response when provisioning a client — includes the plaintext secret (shown only once).
#[derive(Debug, Serialize)]
pub struct ClientCreated {
    pub id: ClientId,
    pub name: String,
    pub api_key: String,
    pub api_secret: String,
    pub created_at: DateTime<Utc>,
}

/// Per-client grant for one capability. At most one row per (client, capability).
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CapabilityPermission {
    pub id: Uuid,
    pub client_id: ClientId,
    pub capability_type: CapabilityType,
    pub enabled: bool,
    /// 0 = unlimited
    pub rate_limit_per_minute: i32,
    /// Daily cost ceiling. None = unlimited.
    pub quota_limit: Option<f64>,
    /// Monthly cost ceiling. Falls back to `quota_limit` when unset.
    pub monthly_quota_limit: Option<f64>,
    pub preferred_provider: Option<String>,
    /// Empty = no restriction
    pub allowed_providers: Vec<String>,
    /// Empty = no restriction
    pub allowed_models: Vec<String>,
    pub priority: i32,
}

/// Admin-supplied fields for creating or replacing a permission.
#[derive(Debug, Clone, Deserialize)]
pub struct PermissionSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: i32,
    pub quota_limit: Option<f64>,
    pub monthly_quota_limit: Option<f64>,
    pub preferred_provider: Option<String>,
    #[serde(default)]
    pub allowed_providers: Vec<String>,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub priority: i32,
}

fn default_true() -> bool {
    true
}

fn default_rate_limit() -> i32 {
    60
}

impl CapabilityPermission {
    pub fn allows_provider(&self, provider: &str) -> bool {
        self.allowed_providers.is_empty()
            || self
                .allowed_providers
                .iter()
                .any(|p| p.eq_ignore_ascii_case(provider))
    }

    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }

    pub fn monthly_ceiling(&self) -> Option<f64> {
        self.monthly_quota_limit.or(self.quota_limit)
    }
}

