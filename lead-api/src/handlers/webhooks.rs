use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use lead_common::error::PipelineError;
use lead_common::model::{Webhook, WebhookParams};
use lead_common::pipeline::LeadPipeline;
use lead_common::webhook::DeliveryOutcome;
use uuid::Uuid;

pub async fn list_webhooks(
    State(pipeline): State<LeadPipeline>,
    Path(source_id): Path<Uuid>,
) -> Result<Json<Vec<Webhook>>, PipelineError> {
    Ok(Json(pipeline.list_webhooks(source_id).await?))
}

pub async fn create_webhook(
    State(pipeline): State<LeadPipeline>,
    Path(source_id): Path<Uuid>,
    Json(params): Json<WebhookParams>,
) -> Result<(StatusCode, Json<Webhook>), PipelineError> {
    let webhook = pipeline.create_webhook(source_id, params).await?;
    Ok((StatusCode::CREATED, Json(webhook)))
}

pub async fn update_webhook(
    State(pipeline): State<LeadPipeline>,
    Path(webhook_id): Path<Uuid>,
    Json(params): Json<WebhookParams>,
) -> Result<Json<Webhook>, PipelineError> {
    Ok(Json(pipeline.update_webhook(webhook_id, params).await?))
}

pub async fn delete_webhook(
    State(pipeline): State<LeadPipeline>,
    Path(webhook_id): Path<Uuid>,
) -> Result<StatusCode, PipelineError> {
    pipeline.delete_webhook(webhook_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Deliver a `test` event to a single webhook. A failed delivery is still a 200: the
/// outcome describes it.
pub async fn test_webhook(
    State(pipeline): State<LeadPipeline>,
    Path(webhook_id): Path<Uuid>,
) -> Result<Json<DeliveryOutcome>, PipelineError> {
    Ok(Json(pipeline.test_webhook(webhook_id).await?))
}
