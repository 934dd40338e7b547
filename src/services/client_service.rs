use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::capability::CapabilityType;
use crate::models::client::{
    CapabilityPermission, Client, ClientCreated, ClientId, ClientInfo, ClientStatus,
    PermissionSpec,
};
use crate::services::credential_gate::CredentialMode;

/// Generate a new API key in the format `ck-{uuid v4}`
pub fn generate_api_key() -> String {
    format!("ck-{}", Uuid::new_v4())
}

/// Generate a new API secret from two v4 UUIDs (244 random bits).
pub fn generate_api_secret() -> String {
    format!("cs-{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// Provision a new active client.
/// Returns the client info plus the plaintext secret (shown only once).
pub async fn create_client(
    name: &str,
    mode: CredentialMode,
    db: &PgPool,
) -> Result<ClientCreated, AppError> {
    let id = Uuid::new_v4();
    let api_key = generate_api_key();
    let api_secret = generate_api_secret();
    let stored_secret = mode.stored_form(&api_secret);
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO clients (id, name, api_key, api_secret_hash, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $6)
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(&api_key)
    .bind(&stored_secret)
    .bind(ClientStatus::Active.as_str())
    .bind(now)
    .execute(db)
    .await?;

    Ok(ClientCreated {
        id,
        name: name.to_string(),
        api_key,
        api_secret,
        created_at: now,
    })
}

/// List all clients, including their stored secret form (for the config cache).
pub async fn list_clients(db: &PgPool) -> Result<Vec<Client>, AppError> {
    let clients = sqlx::query_as::<_, Client>("SELECT * FROM clients ORDER BY created_at DESC")
        .fetch_all(db)
        .await?;
    Ok(clients)
}

/// Change a client's lifecycle status.
pub async fn set_client_status(
    id: ClientId,
    status: ClientStatus,
    db: &PgPool,
) -> Result<ClientInfo, AppError> {
    let updated = sqlx::query_as::<_, Client>(
        "UPDATE clients SET status = $1, updated_at = NOW() WHERE id = $2 RETURNING *",
    )
    .bind(status.as_str())
    .bind(id)
    .fetch_optional(db)
    .await?
    .ok_or(AppError::NotFound)?;

    Ok(ClientInfo::from(updated))
}

/// Remove a client and everything it owns. Usage history is kept: it is a
/// historical fact and references the client only by id.
pub async fn purge_client(id: ClientId, db: &PgPool) -> Result<u64, AppError> {
    let mut tx = db.begin().await?;

    let permissions = sqlx::query("DELETE FROM capability_permissions WHERE client_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    let clients = sqlx::query("DELETE FROM clients WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    if clients == 0 {
        tx.rollback().await?;
        return Err(AppError::NotFound);
    }

    tx.commit().await?;
    tracing::info!(client_id = %id, permissions, "Purged client");
    Ok(permissions)
}

pub async fn list_all_permissions(db: &PgPool) -> Result<Vec<CapabilityPermission>, AppError> {
    let rows = sqlx::query_as::<_, CapabilityPermission>(
        "SELECT * FROM capability_permissions ORDER BY client_id, capability_type",
    )
    .fetch_all(db)
    .await?;
    Ok(rows)
}

pub async fn list_permissions_for(
    client_id: ClientId,
    db: &PgPool,
) -> Result<Vec<CapabilityPermission>, AppError> {
    let rows = sqlx::query_as::<_, CapabilityPermission>(
        "SELECT * FROM capability_permissions WHERE client_id = $1 ORDER BY capability_type",
    )
    .bind(client_id)
    .fetch_all(db)
    .await?;
    Ok(rows)
}

/// Create or replace the single permission row for (client, capability).
pub async fn upsert_permission(
    client_id: ClientId,
    capability: &CapabilityType,
    spec: PermissionSpec,
    db: &PgPool,
) -> Result<CapabilityPermission, AppError> {
    if spec.rate_limit_per_minute < 0 {
        return Err(AppError::BadRequest(
            "rate_limit_per_minute must be >= 0".into(),
        ));
    }
    if spec.quota_limit.is_some_and(|q| q < 0.0) || spec.monthly_quota_limit.is_some_and(|q| q < 0.0)
    {
        return Err(AppError::BadRequest("quota limits must be >= 0".into()));
    }

    let exists = sqlx::query_scalar::<_, Uuid>("SELECT id FROM clients WHERE id = $1")
        .bind(client_id)
        .fetch_optional(db)
        .await?;
    if exists.is_none() {
        return Err(AppError::NotFound);
    }

    let row = sqlx::query_as::<_, CapabilityPermission>(
        r#"
        INSERT INTO capability_permissions (
            id, client_id, capability_type, enabled, rate_limit_per_minute,
            quota_limit, monthly_quota_limit, preferred_provider,
            allowed_providers, allowed_models, priority, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())
        ON CONFLICT (client_id, capability_type) DO UPDATE SET
            enabled = EXCLUDED.enabled,
            rate_limit_per_minute = EXCLUDED.rate_limit_per_minute,
            quota_limit = EXCLUDED.quota_limit,
            monthly_quota_limit = EXCLUDED.monthly_quota_limit,
            preferred_provider = EXCLUDED.preferred_provider,
            allowed_providers = EXCLUDED.allowed_providers,
            allowed_models = EXCLUDED.allowed_models,
            priority = EXCLUDED.priority,
            updated_at = NOW()
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(client_id)
    .bind(capability)
    .bind(spec.enabled)
    .bind(spec.rate_limit_per_minute)
    .bind(spec.quota_limit)
    .bind(spec.monthly_quota_limit)
    .bind(&spec.preferred_provider)
    .bind(&spec.allowed_providers)
    .bind(&spec.allowed_models)
    .bind(spec.priority)
    .fetch_one(db)
    .await?;

    Ok(row)
}

pub async fn delete_permission(
    client_id: ClientId,
    capability: &CapabilityType,
    db: &PgPool,
) -> Result<(), AppError> {
    let result = sqlx::query(
        "DELETE FROM capability_permissions WHERE client_id = $1 AND capability_type = $2",
    )
    .bind(client_id)
    .bind(capability)
    .execute(db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }
    Ok(())
}
