use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult, RowError};
use crate::import::ImportExecutor;
use crate::model::{JobOperation, JobStatus};
use crate::store::LeadStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOutcome {
    pub success: bool,
    pub new_log_id: Uuid,
    pub status: JobStatus,
    pub imported: i64,
    pub failed: i64,
}

/// Re-runs the records that failed in an earlier import as a new `retry` job. The
/// original job is left untouched.
#[derive(Clone)]
pub struct RetryCoordinator {
    store: Arc<dyn LeadStore>,
    executor: ImportExecutor,
}

impl RetryCoordinator {
    pub fn new(store: Arc<dyn LeadStore>, executor: ImportExecutor) -> Self {
        Self { store, executor }
    }

    pub async fn retry(&self, source_id: Uuid, log_id: Uuid) -> PipelineResult<RetryOutcome> {
        let original = self
            .store
            .get_job(log_id)
            .await?
            .filter(|job| job.source_id == source_id)
            .ok_or(PipelineError::not_found("import log", log_id))?;

        match original.operation {
            JobOperation::Import | JobOperation::Retry => {}
            other => {
                return Err(PipelineError::validation(format!(
                    "{} logs cannot be retried",
                    other.as_str()
                )))
            }
        }
        if original.status == JobStatus::Pending {
            return Err(PipelineError::validation("import is still running"));
        }
        // Retrying the same log again would import its recovered records twice.
        if let Some(previous) = self.store.find_retry_of(log_id).await? {
            return Err(PipelineError::Conflict(format!(
                "import log {} was already retried as {}, retry that log instead",
                log_id, previous.id
            )));
        }

        let records: Vec<_> = failed_records(&original.details)?
            .into_iter()
            .map(|failure| failure.record)
            .collect();
        if records.is_empty() {
            return Err(PipelineError::validation("log has no failed records to retry"));
        }

        info!(
            source_id = %source_id,
            log_id = %log_id,
            "retrying {} failed records",
            records.len()
        );

        let mut origin = Map::new();
        origin.insert("retry_of".to_owned(), json!(log_id));
        let summary = self
            .executor
            .run(source_id, records, JobOperation::Retry, origin)
            .await?;

        Ok(RetryOutcome {
            success: summary.success,
            new_log_id: summary.log_id,
            status: summary.status,
            imported: summary.imported,
            failed: summary.failed,
        })
    }
}

fn failed_records(details: &Value) -> PipelineResult<Vec<RowError>> {
    match details.get("errors") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(errors) => serde_json::from_value(errors.clone()).map_err(|e| {
            PipelineError::validation(format!("log has unreadable failure details: {}", e))
        }),
    }
}
