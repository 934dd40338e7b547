use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::capability::CapabilityType;
use crate::models::client::{CapabilityPermission, ClientInfo, ClientStatus, PermissionSpec};
use crate::models::model_config::{ModelConfigInfo, ModelConfigPatch, ModelConfigSpec};
use crate::models::usage_record::UsageListResponse;
use crate::services::capability_router::routing_order;
use crate::services::{client_service, model_service, usage_service};
use crate::state::AppState;

fn parse_capability(raw: &str) -> Result<CapabilityType, AppError> {
    CapabilityType::parse(raw)
        .ok_or_else(|| AppError::BadRequest(format!("Invalid capability type: {raw}")))
}

// ── Client endpoints ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateClientRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: ClientStatus,
}

/// POST /admin/clients — provision a client, returns the secret once
async fn create_client(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateClientRequest>,
) -> Result<impl IntoResponse, AppError> {
    if body.name.trim().is_empty() {
        return Err(AppError::BadRequest("name is required".into()));
    }

    let result =
        client_service::create_client(body.name.trim(), state.config.credential_mode, &state.db)
            .await?;
    state.reload_config().await;

    Ok((StatusCode::CREATED, Json(result)))
}

/// GET /admin/clients
async fn list_clients(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ClientInfo>>, AppError> {
    let clients = client_service::list_clients(&state.db).await?;
    Ok(Json(clients.into_iter().map(ClientInfo::from).collect()))
}

/// PUT /admin/clients/{id}/status
async fn update_client_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateStatusRequest>,
) -> Result<Json<ClientInfo>, AppError> {
    let result = client_service::set_client_status(id, body.status, &state.db).await?;
    state.reload_config().await;
    Ok(Json(result))
}

/// DELETE /admin/clients/{id} — purge the client and its permissions; usage history stays
async fn purge_client(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let removed = client_service::purge_client(id, &state.db).await?;
    tracing::info!(client_id = %id, permissions = removed, "Client purged");
    state.reload_config().await;
    Ok(StatusCode::NO_CONTENT)
}

// ── Permission endpoints ──────────────────────────────────────────────

/// GET /admin/clients/{id}/permissions
async fn list_permissions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<CapabilityPermission>>, AppError> {
    let permissions = client_service::list_permissions_for(id, &state.db).await?;
    Ok(Json(permissions))
}

/// PUT /admin/clients/{id}/permissions/{capability} — create or replace
async fn upsert_permission(
    State(state): State<Arc<AppState>>,
    Path((id, capability)): Path<(Uuid, String)>,
    Json(body): Json<PermissionSpec>,
) -> Result<Json<CapabilityPermission>, AppError> {
    let capability = parse_capability(&capability)?;
    let result = client_service::upsert_permission(id, &capability, body, &state.db).await?;
    state.reload_config().await;
    Ok(Json(result))
}

/// DELETE /admin/clients/{id}/permissions/{capability}
async fn delete_permission(
    State(state): State<Arc<AppState>>,
    Path((id, capability)): Path<(Uuid, String)>,
) -> Result<StatusCode, AppError> {
    let capability = parse_capability(&capability)?;
    client_service::delete_permission(id, &capability, &state.db).await?;
    state.reload_config().await;
    Ok(StatusCode::NO_CONTENT)
}

// ── Model config endpoints ────────────────────────────────────────────

/// POST /admin/models
async fn create_model(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ModelConfigSpec>,
) -> Result<impl IntoResponse, AppError> {
    let result = model_service::create_model_config(body, &state.db).await?;
    state.reload_config().await;
    Ok((StatusCode::CREATED, Json(result)))
}

/// GET /admin/models — in routing order per capability
async fn list_models(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ModelConfigInfo>>, AppError> {
    let mut models = model_service::list_model_configs(&state.db).await?;
    models.sort_by(routing_order);
    Ok(Json(models.into_iter().map(ModelConfigInfo::from).collect()))
}

/// PUT /admin/models/{id}
async fn update_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ModelConfigPatch>,
) -> Result<Json<ModelConfigInfo>, AppError> {
    let result = model_service::update_model_config(id, body, &state.db).await?;
    state.reload_config().await;
    Ok(Json(result))
}

/// DELETE /admin/models/{id}
async fn delete_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    model_service::delete_model_config(id, &state.db).await?;
    state.reload_config().await;
    Ok(StatusCode::NO_CONTENT)
}

// ── Usage endpoints ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListUsageQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub client_id: Option<Uuid>,
    pub capability: Option<String>,
    pub request_id: Option<String>,
}

/// GET /admin/usage — usage records with pagination + optional filters
async fn list_usage(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListUsageQuery>,
) -> Result<Json<UsageListResponse>, AppError> {
    let capability = query.capability.as_deref().map(parse_capability).transpose()?;
    let params = usage_service::ListUsageParams {
        page: query.page.unwrap_or(1).max(1),
        per_page: query.per_page.unwrap_or(50).clamp(1, 200),
        client_id: query.client_id,
        capability,
        request_id: query.request_id,
    };
    let result = usage_service::list_usage(&state.db, params).await?;
    Ok(Json(result))
}

// ── Config endpoints ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ConfigStatus {
    pub clients: usize,
    pub model_configs: usize,
    pub loaded_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// POST /admin/config/refresh — reload the routing snapshot now
async fn refresh_config(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ConfigStatus>, AppError> {
    state.config_store.refresh().await?;
    let snapshot = state.config_store.snapshot();
    Ok(Json(ConfigStatus {
        clients: snapshot.client_count(),
        model_configs: snapshot.model_count(),
        loaded_at: snapshot.loaded_at,
    }))
}

/// Build the admin router (to be nested under /admin)
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        // Clients
        .route("/clients", post(create_client).get(list_clients))
        .route("/clients/{id}", axum::routing::delete(purge_client))
        .route("/clients/{id}/status", put(update_client_status))
        // Permissions
        .route("/clients/{id}/permissions", get(list_permissions))
        .route(
            "/clients/{id}/permissions/{capability}",
            put(upsert_permission).delete(delete_permission),
        )
        // Model configs
        .route("/models", post(create_model).get(list_models))
        .route("/models/{id}", put(update_model).delete(delete_model))
        // Usage
        .route("/usage", get(list_usage))
        // Config
        .route("/config/refresh", post(refresh_config))
}
