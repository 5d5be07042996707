use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, patch, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::state::SharedState;

pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(crate::routes::health::health))
        // Tenant surface
        .route("/api/v1/tests/upload", post(crate::routes::tests::upload_test))
        .route("/api/v1/tests", get(crate::routes::tests::list_tests))
        .route("/api/v1/tests/{id}", get(crate::routes::tests::get_test))
        .route("/api/v1/tests/{id}", patch(crate::routes::tests::patch_test))
        .route("/api/v1/tests/{id}", delete(crate::routes::tests::delete_test))
        .route(
            "/api/v1/tests/{id}/source",
            post(crate::routes::tests::replace_source),
        )
        .route(
            "/api/v1/tests/{id}/disable",
            post(crate::routes::tests::disable_test),
        )
        .route(
            "/api/v1/tests/{id}/enable",
            post(crate::routes::tests::enable_test),
        )
        .route("/api/v1/tests/{id}/run", post(crate::routes::tests::run_now))
        .route(
            "/api/v1/tests/{id}/runs",
            get(crate::routes::tests::list_runs),
        )
        .route("/api/v1/runs/{id}", get(crate::routes::runs::get_run))
        .route(
            "/api/v1/runs/{id}/artifacts/{name}",
            get(crate::routes::runs::download_artifact),
        )
        // Admin / monitor surface
        .route(
            "/api/v1/admin/tenants",
            post(crate::routes::admin::create_tenant),
        )
        .route(
            "/api/v1/admin/tenants",
            get(crate::routes::admin::list_tenants),
        )
        .route(
            "/api/v1/admin/keys",
            post(crate::routes::admin::create_api_key),
        )
        .route(
            "/api/v1/admin/keys/{id}/revoke",
            post(crate::routes::admin::revoke_api_key),
        )
        .route(
            "/api/v1/status/summary",
            get(crate::routes::admin::status_summary),
        )
        // Uploads are capped well below this; the limit is a backstop.
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .with_state(state)
}
