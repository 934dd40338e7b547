//! Admission control: budget quota and request rate, both checked before any
//! provider call.
//!
//! The quota gate reads usage history as of the last recorder flush.
//! Concurrent in-flight requests from one client can each pass the gate and
//! together overshoot the ceiling slightly.

use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Utc};

use crate::error::AppError;
use crate::models::client::{CapabilityPermission, ClientId};
use crate::services::rate_limiter::{RateDecision, RateLimiter};
use crate::services::store::UsageStore;

#[derive(Clone)]
pub struct QuotaLimiter {
    rate: Arc<dyn RateLimiter>,
    usage: Arc<dyn UsageStore>,
}

/// Start of the current UTC day and month.
fn window_starts(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let day = Utc
        .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now);
    let month = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(day);
    (day, month)
}

impl QuotaLimiter {
    pub fn new(rate: Arc<dyn RateLimiter>, usage: Arc<dyn UsageStore>) -> Self {
        Self { rate, usage }
    }

    /// Admit one request or fail with `QuotaExceeded` / `RateLimited`.
    /// Quota is evaluated first, so an exhausted budget is reported regardless
    /// of rate state and never consumes a rate slot.
    pub async fn admit(
        &self,
        client_id: ClientId,
        permission: &CapabilityPermission,
    ) -> Result<(), AppError> {
        self.check_quota(client_id, permission, Utc::now()).await?;
        self.check_rate(client_id, permission).await
    }

    async fn check_quota(
        &self,
        client_id: ClientId,
        permission: &CapabilityPermission,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let daily = permission.quota_limit;
        let monthly = permission.monthly_ceiling();
        if daily.is_none() && monthly.is_none() {
            return Ok(());
        }

        let capability = &permission.capability_type;
        let (day_start, month_start) = window_starts(now);

        if let Some(limit) = daily {
            let spent = self.usage.cost_since(client_id, capability, day_start).await?;
            if spent >= limit {
                tracing::info!(%client_id, %capability, spent, limit, "Daily quota exceeded");
                return Err(AppError::QuotaExceeded {
                    window: "daily",
                    spent,
                    limit,
                });
            }
        }

        if let Some(limit) = monthly {
            let spent = self.usage.cost_since(client_id, capability, month_start).await?;
            if spent >= limit {
                tracing::info!(%client_id, %capability, spent, limit, "Monthly quota exceeded");
                return Err(AppError::QuotaExceeded {
                    window: "monthly",
                    spent,
                    limit,
                });
            }
        }

        Ok(())
    }

    async fn check_rate(
        &self,
        client_id: ClientId,
        permission: &CapabilityPermission,
    ) -> Result<(), AppError> {
        let Ok(limit) = u32::try_from(permission.rate_limit_per_minute) else {
            return Ok(());
        };
        if limit == 0 {
            return Ok(());
        }

        match self
            .rate
            .try_acquire(client_id, &permission.capability_type, limit)
            .await?
        {
            RateDecision::Allowed => Ok(()),
            RateDecision::Limited { retry_after } => {
                tracing::info!(
                    %client_id,
                    capability = %permission.capability_type,
                    limit,
                    "Rate limited"
                );
                Err(AppError::RateLimited {
                    retry_after_secs: retry_after.as_secs_f64().ceil() as u64,
                })
            }
        }
    }
}
