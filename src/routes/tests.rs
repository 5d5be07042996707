use axum::extract::{Multipart, Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::auth::require_tenant;
use crate::config::{
    MAX_INTERVAL_SECONDS, MAX_SOURCE_BYTES, MAX_TIMEOUT_SECONDS, MIN_INTERVAL_SECONDS,
    MIN_TIMEOUT_SECONDS,
};
use crate::error::{ApiError, DetailedError};
use crate::state::SharedState;
use crate::store::{NewTest, Run, SubjectState, Test, TestKind, TestPatch};

#[derive(Serialize)]
pub struct TestResponse {
    #[serde(flatten)]
    pub test: Test,
    pub state: Option<SubjectState>,
}

fn invalid(msg: impl Into<String>, details: serde_json::Value) -> DetailedError {
    ApiError::InvalidRequest(msg.into()).with_details(details)
}

struct ScheduleFields {
    interval_seconds: i64,
    timeout_seconds: i64,
    jitter_seconds: i64,
    down_after_failures: i64,
    up_after_successes: i64,
}

fn validate_schedule(f: &ScheduleFields) -> Result<(), DetailedError> {
    if !(MIN_INTERVAL_SECONDS..=MAX_INTERVAL_SECONDS).contains(&f.interval_seconds) {
        return Err(invalid(
            "interval_seconds out of range",
            serde_json::json!({
                "field": "interval_seconds",
                "min": MIN_INTERVAL_SECONDS,
                "max": MAX_INTERVAL_SECONDS,
                "value": f.interval_seconds,
            }),
        ));
    }
    if !(MIN_TIMEOUT_SECONDS..=MAX_TIMEOUT_SECONDS).contains(&f.timeout_seconds) {
        return Err(invalid(
            "timeout_seconds out of range",
            serde_json::json!({
                "field": "timeout_seconds",
                "min": MIN_TIMEOUT_SECONDS,
                "max": MAX_TIMEOUT_SECONDS,
                "value": f.timeout_seconds,
            }),
        ));
    }
    if f.jitter_seconds < 0 || f.jitter_seconds > f.interval_seconds {
        return Err(invalid(
            "jitter_seconds must be between 0 and interval_seconds",
            serde_json::json!({ "field": "jitter_seconds", "value": f.jitter_seconds }),
        ));
    }
    if f.down_after_failures < 1 || f.up_after_successes < 1 {
        return Err(invalid(
            "debounce thresholds must be at least 1",
            serde_json::json!({
                "down_after_failures": f.down_after_failures,
                "up_after_successes": f.up_after_successes,
            }),
        ));
    }
    Ok(())
}

#[derive(Default)]
struct UploadForm {
    name: Option<String>,
    base_url: Option<String>,
    kind: Option<String>,
    interval_seconds: Option<i64>,
    timeout_seconds: Option<i64>,
    jitter_seconds: Option<i64>,
    down_after_failures: Option<i64>,
    up_after_successes: Option<i64>,
    notify_on_recovery: Option<bool>,
    dispatch_on_failure: Option<bool>,
    file_name: Option<String>,
    file_bytes: Option<Vec<u8>>,
}

async fn read_upload_form(multipart: &mut Multipart) -> Result<UploadForm, DetailedError> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| invalid(format!("malformed multipart body: {}", e), serde_json::json!({})))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                form.file_name = field.file_name().map(|s| s.to_string());
                let bytes = field.bytes().await.map_err(|e| {
                    invalid(format!("failed reading file field: {}", e), serde_json::json!({}))
                })?;
                form.file_bytes = Some(bytes.to_vec());
            }
            other => {
                let text = field.text().await.map_err(|e| {
                    invalid(format!("failed reading field {}: {}", other, e), serde_json::json!({}))
                })?;
                let text = text.trim().to_string();
                match other {
                    "name" => form.name = Some(text),
                    "base_url" => form.base_url = Some(text),
                    "kind" => form.kind = Some(text),
                    "interval_seconds" => form.interval_seconds = text.parse().ok(),
                    "timeout_seconds" => form.timeout_seconds = text.parse().ok(),
                    "jitter_seconds" => form.jitter_seconds = text.parse().ok(),
                    "down_after_failures" => form.down_after_failures = text.parse().ok(),
                    "up_after_successes" => form.up_after_successes = text.parse().ok(),
                    "notify_on_recovery" => form.notify_on_recovery = Some(text == "true" || text == "1"),
                    "dispatch_on_failure" => form.dispatch_on_failure = Some(text == "true" || text == "1"),
                    _ => {}
                }
            }
        }
    }
    Ok(form)
}

fn validate_source(
    kind: TestKind,
    file_name: &str,
    bytes: &[u8],
) -> Result<(), DetailedError> {
    let ext = std::path::Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    if ext != kind.extension() {
        return Err(invalid(
            "file extension does not match declared kind",
            serde_json::json!({
                "kind": kind.as_str(),
                "expected_extension": kind.extension(),
                "file_name": file_name,
            }),
        ));
    }
    if bytes.is_empty() {
        return Err(invalid(
            "source file is empty",
            serde_json::json!({ "file_name": file_name }),
        ));
    }
    if bytes.len() > MAX_SOURCE_BYTES {
        return Err(invalid(
            "source file exceeds size cap",
            serde_json::json!({ "max_bytes": MAX_SOURCE_BYTES, "size": bytes.len() }),
        ));
    }
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

/// Write a source blob under sources/<tenant>/ via tmp + rename so readers
/// never observe a half-written file.
fn write_source_blob(
    state: &SharedState,
    tenant_id: &str,
    kind: TestKind,
    bytes: &[u8],
) -> Result<String, ApiError> {
    let relpath = format!(
        "{}/{}.{}",
        tenant_id,
        uuid::Uuid::new_v4().simple(),
        kind.extension()
    );
    let full = state.config.sources_dir().join(&relpath);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = full.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, &full)?;
    Ok(relpath)
}

pub async fn upload_test(
    State(state): State<SharedState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<TestResponse>, DetailedError> {
    let authed = require_tenant(&state, &headers)?;
    let form = read_upload_form(&mut multipart).await?;

    let name = form
        .name
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("name is required", serde_json::json!({ "field": "name" })))?;
    let base_url = form
        .base_url
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("base_url is required", serde_json::json!({ "field": "base_url" })))?;
    let kind_raw = form
        .kind
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("kind is required", serde_json::json!({ "field": "kind" })))?;
    let kind = TestKind::parse(&kind_raw).ok_or_else(|| {
        invalid(
            "unknown kind",
            serde_json::json!({ "field": "kind", "value": kind_raw,
                "allowed": ["script_python", "script_js"] }),
        )
    })?;

    let schedule = ScheduleFields {
        interval_seconds: form.interval_seconds.unwrap_or(300),
        timeout_seconds: form.timeout_seconds.unwrap_or(45),
        jitter_seconds: form.jitter_seconds.unwrap_or(30),
        down_after_failures: form.down_after_failures.unwrap_or(2),
        up_after_successes: form.up_after_successes.unwrap_or(2),
    };
    validate_schedule(&schedule)?;

    let file_name = form
        .file_name
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("source file is required", serde_json::json!({ "field": "file" })))?;
    let bytes = form
        .file_bytes
        .ok_or_else(|| invalid("source file is required", serde_json::json!({ "field": "file" })))?;
    validate_source(kind, &file_name, &bytes)?;

    let relpath = write_source_blob(&state, &authed.tenant_id, kind, &bytes)?;
    let test = state.store.insert_test(NewTest {
        tenant_id: authed.tenant_id.clone(),
        name,
        base_url,
        kind,
        interval_seconds: schedule.interval_seconds,
        timeout_seconds: schedule.timeout_seconds,
        jitter_seconds: schedule.jitter_seconds,
        down_after_failures: schedule.down_after_failures,
        up_after_successes: schedule.up_after_successes,
        notify_on_recovery: form.notify_on_recovery.unwrap_or(false),
        dispatch_on_failure: form.dispatch_on_failure.unwrap_or(false),
        source_relpath: relpath,
        source_filename: file_name,
        source_sha256: sha256_hex(&bytes),
    });
    let test = test.map_err(ApiError::from)?;
    info!("Test {} created by tenant {}", test.id, authed.tenant_id);

    let state_row = state
        .store
        .get_state(&test.id)
        .map_err(ApiError::from)?;
    Ok(Json(TestResponse {
        test,
        state: state_row,
    }))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub enabled: Option<bool>,
    pub base_url: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    100
}

pub async fn list_tests(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<TestResponse>>, DetailedError> {
    let authed = require_tenant(&state, &headers)?;
    let rows = state
        .store
        .list_tests(
            &authed.tenant_id,
            q.enabled,
            q.base_url.as_deref(),
            q.limit,
            q.offset,
        )
        .map_err(ApiError::from)?;
    Ok(Json(
        rows.into_iter()
            .map(|(test, state)| TestResponse { test, state })
            .collect(),
    ))
}

pub async fn get_test(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(test_id): Path<String>,
) -> Result<Json<TestResponse>, DetailedError> {
    let authed = require_tenant(&state, &headers)?;
    let (test, state_row) = state
        .store
        .get_test(&authed.tenant_id, &test_id)
        .map_err(ApiError::from)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(TestResponse {
        test,
        state: state_row,
    }))
}

#[derive(Deserialize, Default)]
pub struct PatchBody {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub interval_seconds: Option<i64>,
    pub timeout_seconds: Option<i64>,
    pub jitter_seconds: Option<i64>,
    pub down_after_failures: Option<i64>,
    pub up_after_successes: Option<i64>,
    pub notify_on_recovery: Option<bool>,
    pub dispatch_on_failure: Option<bool>,
}

pub async fn patch_test(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(test_id): Path<String>,
    Json(body): Json<PatchBody>,
) -> Result<Json<TestResponse>, DetailedError> {
    let authed = require_tenant(&state, &headers)?;
    let (current, _) = state
        .store
        .get_test(&authed.tenant_id, &test_id)
        .map_err(ApiError::from)?
        .ok_or(ApiError::NotFound)?;

    // Validate the effective schedule after the patch, not each field alone.
    let schedule = ScheduleFields {
        interval_seconds: body.interval_seconds.unwrap_or(current.interval_seconds),
        timeout_seconds: body.timeout_seconds.unwrap_or(current.timeout_seconds),
        jitter_seconds: body.jitter_seconds.unwrap_or(current.jitter_seconds),
        down_after_failures: body.down_after_failures.unwrap_or(current.down_after_failures),
        up_after_successes: body.up_after_successes.unwrap_or(current.up_after_successes),
    };
    validate_schedule(&schedule)?;

    let patch = TestPatch {
        name: body.name.filter(|s| !s.trim().is_empty()),
        base_url: body.base_url.filter(|s| !s.trim().is_empty()),
        interval_seconds: body.interval_seconds,
        timeout_seconds: body.timeout_seconds,
        jitter_seconds: body.jitter_seconds,
        down_after_failures: body.down_after_failures,
        up_after_successes: body.up_after_successes,
        notify_on_recovery: body.notify_on_recovery,
        dispatch_on_failure: body.dispatch_on_failure,
    };
    state
        .store
        .update_test_meta(&authed.tenant_id, &test_id, &patch)
        .map_err(ApiError::from)?;

    let (test, state_row) = state
        .store
        .get_test(&authed.tenant_id, &test_id)
        .map_err(ApiError::from)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(TestResponse {
        test,
        state: state_row,
    }))
}

/// Atomic source swap. Does not touch TestState or past runs; an in-flight
/// leased run keeps its already-copied source and the next run picks up the
/// new blob.
pub async fn replace_source(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(test_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<TestResponse>, DetailedError> {
    let authed = require_tenant(&state, &headers)?;
    let (test, _) = state
        .store
        .get_test(&authed.tenant_id, &test_id)
        .map_err(ApiError::from)?
        .ok_or(ApiError::NotFound)?;

    let form = read_upload_form(&mut multipart).await?;
    let file_name = form
        .file_name
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("source file is required", serde_json::json!({ "field": "file" })))?;
    let bytes = form
        .file_bytes
        .ok_or_else(|| invalid("source file is required", serde_json::json!({ "field": "file" })))?;
    validate_source(test.kind, &file_name, &bytes)?;

    let old_relpath = test.source_relpath.clone();
    let relpath = write_source_blob(&state, &authed.tenant_id, test.kind, &bytes)?;
    state
        .store
        .update_test_source(
            &authed.tenant_id,
            &test_id,
            &relpath,
            &file_name,
            &sha256_hex(&bytes),
        )
        .map_err(ApiError::from)?;

    // Best-effort cleanup of the replaced blob.
    let _ = std::fs::remove_file(state.config.sources_dir().join(old_relpath));

    let (test, state_row) = state
        .store
        .get_test(&authed.tenant_id, &test_id)
        .map_err(ApiError::from)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(TestResponse {
        test,
        state: state_row,
    }))
}

#[derive(Deserialize)]
pub struct DisableBody {
    pub reason: String,
    pub until_ts: Option<f64>,
}

pub async fn disable_test(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(test_id): Path<String>,
    Json(body): Json<DisableBody>,
) -> Result<Json<serde_json::Value>, DetailedError> {
    let authed = require_tenant(&state, &headers)?;
    if body.reason.trim().is_empty() {
        return Err(invalid(
            "reason is required",
            serde_json::json!({ "field": "reason" }),
        ));
    }
    let updated = state
        .store
        .set_test_disabled(
            &authed.tenant_id,
            &test_id,
            true,
            Some(&body.reason),
            body.until_ts,
        )
        .map_err(ApiError::from)?;
    if !updated {
        return Err(ApiError::NotFound.into());
    }
    Ok(Json(serde_json::json!({ "ok": true, "disabled": true })))
}

pub async fn enable_test(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(test_id): Path<String>,
) -> Result<Json<serde_json::Value>, DetailedError> {
    let authed = require_tenant(&state, &headers)?;
    let updated = state
        .store
        .set_test_disabled(&authed.tenant_id, &test_id, false, None, None)
        .map_err(ApiError::from)?;
    if !updated {
        return Err(ApiError::NotFound.into());
    }
    Ok(Json(serde_json::json!({ "ok": true, "disabled": false })))
}

/// Run-now: re-arm the due time; the scheduler enqueues on its next tick,
/// applying the same quotas and single-flight coalescing as interval runs.
pub async fn run_now(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(test_id): Path<String>,
) -> Result<Json<serde_json::Value>, DetailedError> {
    let authed = require_tenant(&state, &headers)?;
    // A repeat trigger while this test is already queued or running
    // coalesces into the open entry; the quota only gates new load.
    let has_open = state
        .store
        .has_open_entry(&test_id)
        .map_err(ApiError::from)?;
    if !has_open {
        let open = state
            .store
            .open_entry_count_for_tenant(&authed.tenant_id)
            .map_err(ApiError::from)?;
        if open >= state.config.per_tenant_concurrency {
            return Err(ApiError::RateLimited.with_details(serde_json::json!({
                "in_flight": open,
                "per_tenant_concurrency": state.config.per_tenant_concurrency,
            })));
        }
    }
    let updated = state
        .store
        .trigger_run_now(&authed.tenant_id, &test_id)
        .map_err(ApiError::from)?;
    if !updated {
        return Err(ApiError::NotFound.into());
    }
    Ok(Json(serde_json::json!({ "ok": true, "queued": true })))
}

#[derive(Deserialize)]
pub struct RunsQuery {
    #[serde(default = "default_runs_limit")]
    pub limit: i64,
}

fn default_runs_limit() -> i64 {
    50
}

pub async fn list_runs(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(test_id): Path<String>,
    Query(q): Query<RunsQuery>,
) -> Result<Json<Vec<Run>>, DetailedError> {
    let authed = require_tenant(&state, &headers)?;
    // 404 for a test outside the tenant's scope, before touching runs.
    state
        .store
        .get_test(&authed.tenant_id, &test_id)
        .map_err(ApiError::from)?
        .ok_or(ApiError::NotFound)?;
    let runs = state
        .store
        .list_runs(&authed.tenant_id, &test_id, q.limit)
        .map_err(ApiError::from)?;
    Ok(Json(runs))
}

pub async fn delete_test(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(test_id): Path<String>,
) -> Result<Json<serde_json::Value>, DetailedError> {
    let authed = require_tenant(&state, &headers)?;
    let (test, _) = state
        .store
        .get_test(&authed.tenant_id, &test_id)
        .map_err(ApiError::from)?
        .ok_or(ApiError::NotFound)?;
    state
        .store
        .delete_test(&authed.tenant_id, &test_id)
        .map_err(ApiError::from)?;
    let _ = std::fs::remove_file(state.config.sources_dir().join(test.source_relpath));
    info!("Test {} deleted by tenant {}", test_id, authed.tenant_id);
    Ok(Json(serde_json::json!({ "ok": true, "deleted": true })))
}
