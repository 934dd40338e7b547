use std::str::FromStr;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::AppError;
use crate::models::client::ClientId;
use crate::services::config_store::ConfigStore;

/// How client secrets are stored and compared.
///
/// `Plain` keeps the raw secret in `api_secret_hash` and exists for local
/// development only; `Hashed` stores the SHA-256 hex digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialMode {
    Plain,
    Hashed,
}

impl CredentialMode {
    /// The form in which a freshly issued secret is persisted.
    pub fn stored_form(&self, secret: &str) -> String {
        match self {
            CredentialMode::Plain => secret.to_string(),
            CredentialMode::Hashed => hash_secret(secret),
        }
    }

    pub fn verify(&self, presented: &str, stored: &str) -> bool {
        let presented = self.stored_form(presented);
        constant_time_eq(presented.as_bytes(), stored.as_bytes())
    }
}

impl FromStr for CredentialMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "plain" => Ok(CredentialMode::Plain),
            "hashed" => Ok(CredentialMode::Hashed),
            other => Err(anyhow::anyhow!(
                "CREDENTIAL_MODE must be \"hashed\" or \"plain\", got \"{other}\""
            )),
        }
    }
}

/// SHA-256 hex digest of a plaintext secret
pub fn hash_secret(plain: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plain.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Resolves inbound credentials to an active client. Read-only.
#[derive(Clone)]
pub struct CredentialGate {
    config: Arc<ConfigStore>,
    mode: CredentialMode,
}

impl CredentialGate {
    pub fn new(config: Arc<ConfigStore>, mode: CredentialMode) -> Self {
        Self { config, mode }
    }

    pub fn authenticate(
        &self,
        api_key: Option<&str>,
        api_secret: Option<&str>,
    ) -> Result<ClientId, AppError> {
        let (Some(api_key), Some(api_secret)) = (api_key, api_secret) else {
            return Err(AppError::Unauthenticated);
        };

        let snapshot = self.config.snapshot();
        let client = snapshot
            .client_by_key(api_key)
            .ok_or(AppError::Unauthenticated)?;

        if !self.mode.verify(api_secret, &client.api_secret_hash) {
            tracing::debug!(client_id = %client.id, "Client secret mismatch");
            return Err(AppError::Unauthenticated);
        }
        if !client.is_active() {
            tracing::debug!(client_id = %client.id, status = client.status.as_str(), "Client not active");
            return Err(AppError::Unauthenticated);
        }

        Ok(client.id)
    }
}
