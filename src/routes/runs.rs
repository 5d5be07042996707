use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::auth::require_tenant;
use crate::error::{ApiError, DetailedError};
use crate::state::SharedState;
use crate::store::Run;

pub async fn get_run(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, DetailedError> {
    let authed = require_tenant(&state, &headers)?;
    let run = state
        .store
        .get_run(&authed.tenant_id, &run_id)
        .map_err(ApiError::from)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(run))
}

fn content_type_for(name: &str) -> &'static str {
    match std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
    {
        "png" => "image/png",
        "zip" => "application/zip",
        "json" => "application/json",
        "log" | "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

pub async fn download_artifact(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((run_id, name)): Path<(String, String)>,
) -> Result<Response, DetailedError> {
    let authed = require_tenant(&state, &headers)?;

    // Artifact names are flat; anything path-like is an attack, not a miss.
    if name.contains('/') || name.contains('\\') || name.contains("..") || name.is_empty() {
        return Err(ApiError::InvalidRequest("invalid artifact name".to_string()).into());
    }

    let (tenant_id, test_id) = state
        .store
        .run_scope(&authed.tenant_id, &run_id)
        .map_err(ApiError::from)?
        .ok_or(ApiError::NotFound)?;

    let path = state
        .config
        .artifacts_dir()
        .join(tenant_id)
        .join(test_id)
        .join(&run_id)
        .join(&name);

    let bytes = tokio::fs::read(&path).await.map_err(|_| ApiError::NotFound)?;
    Ok((
        [
            (header::CONTENT_TYPE, content_type_for(&name).to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", name),
            ),
        ],
        bytes,
    )
        .into_response())
}
