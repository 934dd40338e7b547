use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::capability::CapabilityType;
use crate::models::model_config::{ModelConfig, ModelConfigInfo, ModelConfigPatch, ModelConfigSpec};
use crate::models::provider::ProviderKind;

fn validate_limits(timeout_ms: i64, retries: i32, input: f64, output: f64) -> Result<(), AppError> {
    if timeout_ms <= 0 {
        return Err(AppError::BadRequest("timeout_ms must be > 0".into()));
    }
    if retries < 0 {
        return Err(AppError::BadRequest("retries must be >= 0".into()));
    }
    if input < 0.0 || output < 0.0 {
        return Err(AppError::BadRequest("pricing must be >= 0".into()));
    }
    Ok(())
}

/// Resolve the endpoint for a new config: explicit value, else the provider kind's default.
fn resolve_endpoint(provider: &str, endpoint: Option<&str>) -> Result<String, AppError> {
    match endpoint.map(str::trim).filter(|e| !e.is_empty()) {
        Some(e) => Ok(e.trim_end_matches('/').to_string()),
        None => ProviderKind::from_name(provider)
            .map(|k| k.default_base_url().to_string())
            .ok_or_else(|| {
                AppError::BadRequest(format!(
                    "endpoint is required for provider \"{provider}\""
                ))
            }),
    }
}

/// Create a new model config.
pub async fn create_model_config(
    spec: ModelConfigSpec,
    db: &PgPool,
) -> Result<ModelConfigInfo, AppError> {
    let capability = CapabilityType::parse(&spec.capability_type).ok_or_else(|| {
        AppError::BadRequest(format!("Invalid capability type: {}", spec.capability_type))
    })?;
    if spec.provider.trim().is_empty() || spec.model.trim().is_empty() {
        return Err(AppError::BadRequest("provider and model are required".into()));
    }
    validate_limits(
        spec.timeout_ms,
        spec.retries,
        spec.input_cost_per_1k,
        spec.output_cost_per_1k,
    )?;
    let endpoint = resolve_endpoint(&spec.provider, spec.endpoint.as_deref())?;

    let id = Uuid::new_v4();
    let now = Utc::now();

    let inserted = sqlx::query_as::<_, ModelConfig>(
        r#"
        INSERT INTO model_configs (
            id, capability_type, provider, model, enabled, priority, endpoint, credential,
            timeout_ms, retries, input_cost_per_1k, output_cost_per_1k, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
        ON CONFLICT (capability_type, provider, model) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&capability)
    .bind(spec.provider.trim())
    .bind(spec.model.trim())
    .bind(spec.enabled)
    .bind(spec.priority)
    .bind(&endpoint)
    .bind(&spec.credential)
    .bind(spec.timeout_ms)
    .bind(spec.retries)
    .bind(spec.input_cost_per_1k)
    .bind(spec.output_cost_per_1k)
    .bind(now)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| {
        AppError::BadRequest(format!(
            "A config for {capability} / {} / {} already exists",
            spec.provider, spec.model
        ))
    })?;

    Ok(ModelConfigInfo::from(inserted))
}

/// List all model configs, enabled or not, in a stable order.
pub async fn list_model_configs(db: &PgPool) -> Result<Vec<ModelConfig>, AppError> {
    let rows = sqlx::query_as::<_, ModelConfig>(
        "SELECT * FROM model_configs ORDER BY capability_type, provider, model",
    )
    .fetch_all(db)
    .await?;
    Ok(rows)
}

/// Update an existing model config. Identity fields (capability, provider, model) are immutable.
pub async fn update_model_config(
    id: Uuid,
    patch: ModelConfigPatch,
    db: &PgPool,
) -> Result<ModelConfigInfo, AppError> {
    let existing = sqlx::query_as::<_, ModelConfig>("SELECT * FROM model_configs WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or(AppError::NotFound)?;

    let enabled = patch.enabled.unwrap_or(existing.enabled);
    let priority = patch.priority.unwrap_or(existing.priority);
    let endpoint = match patch.endpoint.as_deref() {
        Some(e) => resolve_endpoint(&existing.provider, Some(e))?,
        None => existing.endpoint,
    };
    let credential = patch.credential.unwrap_or(existing.credential);
    let timeout_ms = patch.timeout_ms.unwrap_or(existing.timeout_ms);
    let retries = patch.retries.unwrap_or(existing.retries);
    let input = patch.input_cost_per_1k.unwrap_or(existing.input_cost_per_1k);
    let output = patch.output_cost_per_1k.unwrap_or(existing.output_cost_per_1k);
    validate_limits(timeout_ms, retries, input, output)?;

    let updated = sqlx::query_as::<_, ModelConfig>(
        r#"
        UPDATE model_configs
        SET enabled = $1, priority = $2, endpoint = $3, credential = $4, timeout_ms = $5,
            retries = $6, input_cost_per_1k = $7, output_cost_per_1k = $8, updated_at = NOW()
        WHERE id = $9
        RETURNING *
        "#,
    )
    .bind(enabled)
    .bind(priority)
    .bind(&endpoint)
    .bind(&credential)
    .bind(timeout_ms)
    .bind(retries)
    .bind(input)
    .bind(output)
    .bind(id)
    .fetch_one(db)
    .await?;

    Ok(ModelConfigInfo::from(updated))
}

/// Delete a model config. Usage history keeps its provider/model names.
pub async fn delete_model_config(id: Uuid, db: &PgPool) -> Result<(), AppError> {
    let result = sqlx::query("DELETE FROM model_configs WHERE id = $1")
        .bind(id)
        .execute(db)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_provider_kinds_get_a_default_endpoint() {
        assert_eq!(
            resolve_endpoint("openai", None).unwrap(),
            "https://api.openai.com/v1"
        );
        assert_eq!(
            resolve_endpoint("custom", Some("https://llm.internal/v1/")).unwrap(),
            "https://llm.internal/v1"
        );
        assert!(matches!(
            resolve_endpoint("custom", Some("  ")),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn limits_are_validated() {
        assert!(validate_limits(1000, 0, 0.0, 0.0).is_ok());
        assert!(validate_limits(0, 0, 0.0, 0.0).is_err());
        assert!(validate_limits(1000, -1, 0.0, 0.0).is_err());
        assert!(validate_limits(1000, 1, -0.1, 0.0).is_err());
    }
}
