use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::{generate_token, hash_token, require_admin, require_monitor};
use crate::error::{ApiError, DetailedError};
use crate::state::SharedState;
use crate::store::{ApiKeyRecord, StatusSummary, Tenant};

#[derive(Deserialize)]
pub struct CreateTenantBody {
    pub name: String,
}

pub async fn create_tenant(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<CreateTenantBody>,
) -> Result<Json<Tenant>, DetailedError> {
    require_admin(&state, &headers)?;
    if body.name.trim().is_empty() {
        return Err(ApiError::InvalidRequest("name is required".to_string())
            .with_details(serde_json::json!({ "field": "name" })));
    }
    let tenant = state
        .store
        .create_tenant(&body.name)
        .map_err(ApiError::from)?;
    info!("Tenant {} ({}) created", tenant.name, tenant.id);
    Ok(Json(tenant))
}

pub async fn list_tenants(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Tenant>>, DetailedError> {
    require_admin(&state, &headers)?;
    let tenants = state.store.list_tenants().map_err(ApiError::from)?;
    Ok(Json(tenants))
}

#[derive(Deserialize)]
pub struct CreateKeyBody {
    pub tenant_id: String,
    pub name: String,
}

#[derive(Serialize)]
pub struct CreateKeyResponse {
    /// Raw token, shown exactly once; only its hash is stored.
    pub token: String,
    pub key: ApiKeyRecord,
}

pub async fn create_api_key(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<CreateKeyBody>,
) -> Result<Json<CreateKeyResponse>, DetailedError> {
    require_admin(&state, &headers)?;
    if body.tenant_id.trim().is_empty() || body.name.trim().is_empty() {
        return Err(ApiError::InvalidRequest("tenant_id and name are required".to_string())
            .with_details(serde_json::json!({ "fields": ["tenant_id", "name"] })));
    }
    let token = generate_token();
    let key = state
        .store
        .create_api_key(&body.tenant_id, &body.name, &hash_token(&token))
        .map_err(ApiError::from)?;
    info!("API key {} created for tenant {}", key.id, key.tenant_id);
    Ok(Json(CreateKeyResponse { token, key }))
}

pub async fn revoke_api_key(
    State(state): State<SharedState>,
    headers: HeaderMap,
    axum::extract::Path(key_id): axum::extract::Path<String>,
) -> Result<Json<serde_json::Value>, DetailedError> {
    require_admin(&state, &headers)?;
    let revoked = state.store.revoke_api_key(&key_id).map_err(ApiError::from)?;
    if !revoked {
        return Err(ApiError::NotFound.into());
    }
    info!("API key {} revoked", key_id);
    Ok(Json(serde_json::json!({ "ok": true, "revoked": true })))
}

/// Aggregate status for dashboards and external meta-monitoring. Accessible
/// with the admin token or the read-only monitor token.
pub async fn status_summary(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<StatusSummary>, DetailedError> {
    require_monitor(&state, &headers)?;
    let summary = state.store.status_summary(5).map_err(ApiError::from)?;
    Ok(Json(summary))
}
