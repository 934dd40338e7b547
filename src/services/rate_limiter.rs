use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::capability::CapabilityType;
use crate::models::client::ClientId;

pub const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

/// Sliding-window request counter keyed by (client, capability).
///
/// `try_acquire` checks and records in one atomic step per key: a rejected
/// request never consumes a slot.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn try_acquire(
        &self,
        client_id: ClientId,
        capability: &CapabilityType,
        limit_per_window: u32,
    ) -> Result<RateDecision, AppError>;
}

/// Process-local limiter. Each key has its own log of admitted instants,
/// guarded by its map shard; there is no global lock.
#[derive(Default)]
pub struct MemoryRateLimiter {
    windows: DashMap<(ClientId, CapabilityType), VecDeque<Instant>>,
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop keys whose window has fully drained. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, log| {
            while log.front().is_some_and(|t| now.duration_since(*t) >= RATE_WINDOW) {
                log.pop_front();
            }
            !log.is_empty()
        });
        before - self.windows.len()
    }

    fn acquire(&self, key: (ClientId, CapabilityType), limit: u32) -> RateDecision {
        let now = Instant::now();
        let mut log = self.windows.entry(key).or_default();

        while log.front().is_some_and(|t| now.duration_since(*t) >= RATE_WINDOW) {
            log.pop_front();
        }

        if log.len() >= limit as usize {
            let retry_after = log
                .front()
                .map(|oldest| RATE_WINDOW.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(RATE_WINDOW);
            return RateDecision::Limited { retry_after };
        }

        log.push_back(now);
        RateDecision::Allowed
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn try_acquire(
        &self,
        client_id: ClientId,
        capability: &CapabilityType,
        limit_per_window: u32,
    ) -> Result<RateDecision, AppError> {
        Ok(self.acquire((client_id, capability.clone()), limit_per_window))
    }
}

const REDIS_RATE_KEY_PREFIX: &str = "gateway:rate";

/// Prune, count, and conditionally add in a single server-side step.
/// Returns `{1, 0}` when admitted, `{0, retry_after_ms}` when limited.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
if redis.call('ZCARD', key) >= limit then
    local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    local retry = window
    if oldest[2] then
        retry = tonumber(oldest[2]) + window - now
    end
    return {0, retry}
end
redis.call('ZADD', key, now, ARGV[4])
redis.call('PEXPIRE', key, window)
return {1, 0}
"#;

/// Limiter shared by every gateway instance pointing at the same Redis.
pub struct RedisRateLimiter {
    redis: ConnectionManager,
    script: redis::Script,
}

impl RedisRateLimiter {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            script: redis::Script::new(SLIDING_WINDOW_SCRIPT),
        }
    }

    fn key(client_id: ClientId, capability: &CapabilityType) -> String {
        format!("{REDIS_RATE_KEY_PREFIX}:{client_id}:{capability}")
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn try_acquire(
        &self,
        client_id: ClientId,
        capability: &CapabilityType,
        limit_per_window: u32,
    ) -> Result<RateDecision, AppError> {
        let mut conn = self.redis.clone();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let reply: Vec<i64> = self
            .script
            .key(Self::key(client_id, capability))
            .arg(now_ms)
            .arg(RATE_WINDOW.as_millis() as i64)
            .arg(limit_per_window)
            .arg(Uuid::new_v4().to_string())
            .invoke_async(&mut conn)
            .await?;

        match reply.as_slice() {
            [1, ..] => Ok(RateDecision::Allowed),
            [0, retry_ms, ..] => Ok(RateDecision::Limited {
                retry_after: Duration::from_millis((*retry_ms).max(0) as u64),
            }),
            other => Err(AppError::Internal(format!(
                "unexpected rate limit script reply: {other:?}"
            ))),
        }
    }
}
