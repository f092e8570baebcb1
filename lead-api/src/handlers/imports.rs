use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::Json;
use lead_common::audit::{LogPage, DEFAULT_PAGE_LIMIT};
use lead_common::error::PipelineError;
use lead_common::import::ImportSummary;
use lead_common::model::RawRecord;
use lead_common::pipeline::LeadPipeline;
use lead_common::retry::RetryOutcome;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

#[derive(Deserialize, Debug)]
pub struct ImportRequest {
    rows: Vec<Map<String, Value>>,
}

/// JSON scalars are kept in their text form and `null` leaves the field out. Nested
/// values have no raw field representation.
fn raw_record(row: usize, fields: Map<String, Value>) -> Result<RawRecord, PipelineError> {
    let mut record = RawRecord::new();
    for (name, value) in fields {
        let text = match value {
            Value::Null => continue,
            Value::String(text) => text,
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            Value::Array(_) | Value::Object(_) => {
                return Err(PipelineError::validation(format!(
                    "row {} field {} must be a string, number or boolean",
                    row + 1,
                    name
                )))
            }
        };
        record.insert(name, text);
    }
    Ok(record)
}

#[derive(Deserialize, Debug, Default)]
pub struct LogsQuery {
    page: Option<i64>,
    limit: Option<i64>,
}

pub async fn run_import(
    State(pipeline): State<LeadPipeline>,
    Path(source_id): Path<Uuid>,
    payload: Result<Json<ImportRequest>, JsonRejection>,
) -> Result<Json<ImportSummary>, PipelineError> {
    let Json(payload) = payload.map_err(|e| PipelineError::validation(e.body_text()))?;
    debug!(source_id = %source_id, "received {} rows", payload.rows.len());

    let rows = payload
        .rows
        .into_iter()
        .enumerate()
        .map(|(row, fields)| raw_record(row, fields))
        .collect::<Result<Vec<_>, _>>()?;

    let start_time = Instant::now();
    let summary = pipeline.run_import(source_id, rows).await?;
    metrics::histogram!("lead_api_import_duration_seconds").record(start_time.elapsed().as_secs_f64());

    Ok(Json(summary))
}

/// Import a delimited text upload, parsed with the source's configuration.
pub async fn import_file(
    State(pipeline): State<LeadPipeline>,
    Path(source_id): Path<Uuid>,
    body: String,
) -> Result<Json<ImportSummary>, PipelineError> {
    debug!(source_id = %source_id, "received {} bytes of delimited text", body.len());

    let start_time = Instant::now();
    let summary = pipeline.import_text(source_id, &body).await?;
    metrics::histogram!("lead_api_import_duration_seconds").record(start_time.elapsed().as_secs_f64());

    Ok(Json(summary))
}

pub async fn get_logs(
    State(pipeline): State<LeadPipeline>,
    Path(source_id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogPage>, PipelineError> {
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);

    Ok(Json(pipeline.get_logs(source_id, page, limit).await?))
}

pub async fn retry_import(
    State(pipeline): State<LeadPipeline>,
    Path((source_id, log_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<RetryOutcome>, PipelineError> {
    Ok(Json(pipeline.retry_import(source_id, log_id).await?))
}
