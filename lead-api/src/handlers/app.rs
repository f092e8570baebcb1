use axum::{extract::DefaultBodyLimit, routing, Router};
use lead_common::pipeline::LeadPipeline;
use tower::limit::GlobalConcurrencyLimitLayer;

use super::{imports, sources, webhooks};

pub fn add_routes(
    router: Router,
    pipeline: LeadPipeline,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    let api = Router::new()
        .route("/sources", routing::post(sources::create_source))
        .route("/sources/:source_id", routing::get(sources::get_source))
        .route("/sources/:source_id/imports", routing::post(imports::run_import))
        .route(
            "/sources/:source_id/imports/file",
            routing::post(imports::import_file),
        )
        .route("/sources/:source_id/logs", routing::get(imports::get_logs))
        .route(
            "/sources/:source_id/logs/:log_id/retry",
            routing::post(imports::retry_import),
        )
        .route(
            "/sources/:source_id/test",
            routing::post(sources::test_connection),
        )
        .route(
            "/sources/:source_id/mapping",
            routing::get(sources::get_mapping).put(sources::save_mapping),
        )
        .route(
            "/sources/:source_id/webhooks",
            routing::get(webhooks::list_webhooks).post(webhooks::create_webhook),
        )
        .route(
            "/webhooks/:webhook_id",
            routing::put(webhooks::update_webhook).delete(webhooks::delete_webhook),
        )
        .route(
            "/webhooks/:webhook_id/test",
            routing::post(webhooks::test_webhook),
        )
        .layer(GlobalConcurrencyLimitLayer::new(concurrency_limit))
        .layer(DefaultBodyLimit::max(max_body_size))
        .with_state(pipeline);

    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)) // No background loop, just check axum health
        .merge(api)
}

pub async fn index() -> &'static str {
    "lead-api"
}
