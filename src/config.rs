use std::env;
use std::time::Duration;

use crate::services::credential_gate::CredentialMode;

/// Usage must cover a full calendar month for the monthly quota window.
const MIN_USAGE_RETENTION_DAYS: u32 = 31;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// When set, rate counters live in Redis and are shared across gateway instances.
    pub redis_url: Option<String>,
    pub admin_key: String,
    pub listen_addr: String,
    /// Comma-separated list of allowed CORS origins, or "*" for any.
    pub cors_origin: String,
    /// How client secrets are stored and compared.
    pub credential_mode: CredentialMode,
    /// Upper bound on how stale the routing config may be.
    pub config_refresh: Duration,
    /// Gateway-wide cap on provider attempts within one request.
    pub max_attempts_per_request: usize,
    /// Number of days to retain usage records. 0 = keep forever.
    pub usage_retention_days: u32,
    pub billing_currency: String,
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let credential_mode = match env::var("CREDENTIAL_MODE") {
            Ok(v) => v.parse()?,
            Err(_) => CredentialMode::Hashed,
        };

        let mut usage_retention_days = parse_env("USAGE_RETENTION_DAYS", 0u32);
        if usage_retention_days > 0 && usage_retention_days < MIN_USAGE_RETENTION_DAYS {
            tracing::warn!(
                "USAGE_RETENTION_DAYS={} is shorter than a quota month, using {}",
                usage_retention_days,
                MIN_USAGE_RETENTION_DAYS
            );
            usage_retention_days = MIN_USAGE_RETENTION_DAYS;
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL is required"))?,
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()),
            admin_key: env::var("ADMIN_KEY")
                .map_err(|_| anyhow::anyhow!("ADMIN_KEY is required"))?,
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into()),
            cors_origin: env::var("CORS_ORIGIN").unwrap_or_else(|_| "*".into()),
            credential_mode,
            config_refresh: Duration::from_secs(parse_env("CONFIG_REFRESH_SECS", 30u64).max(1)),
            max_attempts_per_request: parse_env("MAX_ATTEMPTS_PER_REQUEST", 5usize).max(1),
            usage_retention_days,
            billing_currency: env::var("BILLING_CURRENCY").unwrap_or_else(|_| "USD".into()),
        })
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Self {
        Self {
            database_url: "postgres://localhost/gateway_test".into(),
            redis_url: None,
            admin_key: "admin-secret".into(),
            listen_addr: "127.0.0.1:0".into(),
            cors_origin: "*".into(),
            credential_mode: CredentialMode::Hashed,
            config_refresh: Duration::from_secs(30),
            max_attempts_per_request: 5,
            usage_retention_days: 0,
            billing_currency: "USD".into(),
        }
    }
}
