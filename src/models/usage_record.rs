use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::capability::{CapabilityType, TokenUsage};
use crate::models::client::ClientId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Success,
    Failure,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown usage status: {0}")]
pub struct UnknownUsageStatus(String);

impl UsageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageStatus::Success => "success",
            UsageStatus::Failure => "failure",
        }
    }
}

impl TryFrom<String> for UsageStatus {
    type Error = UnknownUsageStatus;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "success" => Ok(UsageStatus::Success),
            "failure" => Ok(UsageStatus::Failure),
            _ => Err(UnknownUsageStatus(s)),
        }
    }
}

/// One attempt against one backend. Append-only.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub client_id: ClientId,
    pub request_id: String,
    pub capability_type: CapabilityType,
    pub provider: String,
    pub model: String,
    #[sqlx(try_from = "String")]
    pub status: UsageStatus,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub total_tokens: i32,
    pub cost: f64,
    pub response_time_ms: i32,
    pub is_stream: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for appending a usage record (built by the recorder).
#[derive(Debug, Clone)]
pub struct NewUsageRecord {
    pub client_id: ClientId,
    pub request_id: String,
    pub capability_type: CapabilityType,
    pub provider: String,
    pub model: String,
    pub status: UsageStatus,
    pub usage: TokenUsage,
    pub cost: f64,
    pub response_time_ms: i32,
    pub is_stream: bool,
    pub error_message: Option<String>,
}

impl NewUsageRecord {
    pub fn into_record(self, id: Uuid, created_at: DateTime<Utc>) -> UsageRecord {
        UsageRecord {
            id,
            client_id: self.client_id,
            request_id: self.request_id,
            capability_type: self.capability_type,
            provider: self.provider,
            model: self.model,
            status: self.status,
            prompt_tokens: clamp_i32(self.usage.prompt_tokens),
            completion_tokens: clamp_i32(self.usage.completion_tokens),
            total_tokens: clamp_i32(self.usage.total()),
            cost: self.cost,
            response_time_ms: self.response_time_ms,
            is_stream: self.is_stream,
            error_message: self.error_message,
            created_at,
        }
    }
}

fn clamp_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

/// Paginated response wrapper for usage listing.
#[derive(Debug, Serialize)]
pub struct UsageListResponse {
    pub data: Vec<UsageRecord>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}
