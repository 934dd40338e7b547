use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::capability::CapabilityType;
use crate::models::client::ClientId;
use crate::models::usage_record::{NewUsageRecord, UsageListResponse, UsageRecord};

/// Append a usage record.
pub async fn insert_usage(db: &PgPool, record: NewUsageRecord) -> Result<(), AppError> {
    let row = record.into_record(Uuid::new_v4(), Utc::now());

    sqlx::query(
        r#"
        INSERT INTO usage_records (
            id, client_id, request_id, capability_type, provider, model, status,
            prompt_tokens, completion_tokens, total_tokens, cost, response_time_ms,
            is_stream, error_message, created_at
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15
        )
        "#,
    )
    .bind(row.id)
    .bind(row.client_id)
    .bind(&row.request_id)
    .bind(&row.capability_type)
    .bind(&row.provider)
    .bind(&row.model)
    .bind(row.status.as_str())
    .bind(row.prompt_tokens)
    .bind(row.completion_tokens)
    .bind(row.total_tokens)
    .bind(row.cost)
    .bind(row.response_time_ms)
    .bind(row.is_stream)
    .bind(&row.error_message)
    .bind(row.created_at)
    .execute(db)
    .await?;

    Ok(())
}

/// Total cost for a client and capability since `since`.
/// Scans history at request time; fine for the indexed (client, capability, time) range.
pub async fn sum_cost_since(
    db: &PgPool,
    client_id: ClientId,
    capability: &CapabilityType,
    since: DateTime<Utc>,
) -> Result<f64, AppError> {
    let total: Option<f64> = sqlx::query_scalar(
        r#"
        SELECT SUM(cost) FROM usage_records
        WHERE client_id = $1 AND capability_type = $2 AND created_at >= $3
        "#,
    )
    .bind(client_id)
    .bind(capability)
    .bind(since)
    .fetch_one(db)
    .await?;

    Ok(total.unwrap_or(0.0))
}

/// Query parameters for listing usage.
pub struct ListUsageParams {
    pub page: i64,
    pub per_page: i64,
    pub client_id: Option<ClientId>,
    pub capability: Option<CapabilityType>,
    pub request_id: Option<String>,
}

impl ListUsageParams {
    /// WHERE clause for the active filters, with placeholders numbered from `first`.
    fn where_clause(&self, first: usize) -> String {
        let filters = [
            ("client_id", self.client_id.is_some()),
            ("capability_type", self.capability.is_some()),
            ("request_id", self.request_id.is_some()),
        ];
        let conditions: Vec<String> = filters
            .iter()
            .filter(|(_, active)| *active)
            .enumerate()
            .map(|(i, (column, _))| format!("{column} = ${}", first + i))
            .collect();

        if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        }
    }
}

/// List usage records with offset-based pagination and optional filters.
pub async fn list_usage(
    db: &PgPool,
    params: ListUsageParams,
) -> Result<UsageListResponse, AppError> {
    let offset = (params.page - 1).max(0) * params.per_page;

    let count_query = format!(
        "SELECT COUNT(*) FROM usage_records {}",
        params.where_clause(1)
    );
    // $1/$2 are LIMIT/OFFSET on the data query; filters are numbered after them.
    let data_query = format!(
        "SELECT * FROM usage_records {} ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        params.where_clause(3)
    );

    let total: i64 = {
        let mut q = sqlx::query_scalar::<_, i64>(&count_query);
        if let Some(ref cid) = params.client_id {
            q = q.bind(cid);
        }
        if let Some(ref cap) = params.capability {
            q = q.bind(cap);
        }
        if let Some(ref rid) = params.request_id {
            q = q.bind(rid);
        }
        q.fetch_one(db).await?
    };

    let data: Vec<UsageRecord> = {
        let mut q = sqlx::query_as::<_, UsageRecord>(&data_query)
            .bind(params.per_page)
            .bind(offset);
        if let Some(ref cid) = params.client_id {
            q = q.bind(cid);
        }
        if let Some(ref cap) = params.capability {
            q = q.bind(cap);
        }
        if let Some(ref rid) = params.request_id {
            q = q.bind(rid);
        }
        q.fetch_all(db).await?
    };

    Ok(UsageListResponse {
        data,
        total,
        page: params.page,
        per_page: params.per_page,
    })
}

/// Delete usage records older than `retention_days` days.
/// Returns the number of rows deleted.
pub async fn cleanup_old_usage(db: &PgPool, retention_days: u32) -> Result<u64, AppError> {
    let result = sqlx::query(
        "DELETE FROM usage_records WHERE created_at < NOW() - make_interval(days => $1)",
    )
    .bind(retention_days as i32)
    .execute(db)
    .await?;

    Ok(result.rows_affected())
}
