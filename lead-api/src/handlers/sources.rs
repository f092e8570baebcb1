use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use lead_common::connection::ConnectionReport;
use lead_common::error::PipelineError;
use lead_common::mapping::FieldMapping;
use lead_common::model::{LeadSource, NewLeadSource};
use lead_common::pipeline::LeadPipeline;
use tracing::debug;
use uuid::Uuid;

pub async fn create_source(
    State(pipeline): State<LeadPipeline>,
    Json(payload): Json<NewLeadSource>,
) -> Result<(StatusCode, Json<LeadSource>), PipelineError> {
    debug!("creating source {:?}", payload.name);

    let source = pipeline.create_source(payload).await?;
    Ok((StatusCode::CREATED, Json(source)))
}

pub async fn get_source(
    State(pipeline): State<LeadPipeline>,
    Path(source_id): Path<Uuid>,
) -> Result<Json<LeadSource>, PipelineError> {
    Ok(Json(pipeline.get_source(source_id).await?))
}

pub async fn test_connection(
    State(pipeline): State<LeadPipeline>,
    Path(source_id): Path<Uuid>,
) -> Result<Json<ConnectionReport>, PipelineError> {
    Ok(Json(pipeline.test_connection(source_id).await?))
}

pub async fn get_mapping(
    State(pipeline): State<LeadPipeline>,
    Path(source_id): Path<Uuid>,
) -> Result<Json<FieldMapping>, PipelineError> {
    Ok(Json(pipeline.get_mapping(source_id).await?))
}

pub async fn save_mapping(
    State(pipeline): State<LeadPipeline>,
    Path(source_id): Path<Uuid>,
    Json(mapping): Json<FieldMapping>,
) -> Result<Json<FieldMapping>, PipelineError> {
    Ok(Json(pipeline.save_mapping(source_id, mapping).await?))
}
